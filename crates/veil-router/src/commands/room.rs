use veil_shared::protocol::{InfoKind, RoomRequest, RoomResponse};
use veil_shared::{Payload, RouterType, VeilError};

use super::Connection;
use crate::context::RouterContext;

pub async fn handle(
    ctx: &RouterContext,
    conn: &Connection,
    req: RoomRequest,
) -> Result<Vec<Payload>, VeilError> {
    conn.require_role(RouterType::Message)?;
    let client = conn.require_client()?;
    req.validate()?;

    let response = match req {
        RoomRequest::Browse => RoomResponse {
            rooms: ctx.directory.room_browse(&client).await?,
            members: Vec::new(),
        },
        RoomRequest::Join { room } => {
            let members = ctx.directory.room_join(&client, &room).await?;
            if let Some(member) = members.iter().find(|m| m.id == client).cloned() {
                let recipients = ctx.directory.room_recipients(&client, &room).await?;
                ctx.notify(client, InfoKind::Join, member, Some(room), recipients);
            }
            RoomResponse {
                rooms: Vec::new(),
                members,
            }
        }
        RoomRequest::Quit { room } => {
            // Collect the audience while the client is still a member.
            let recipients = ctx.directory.room_recipients(&client, &room).await?;
            ctx.directory.room_quit(&client, &room).await?;
            if let Some(member) = ctx.directory.member(&client).await {
                ctx.notify(client, InfoKind::Leave, member, Some(room), recipients);
            }
            RoomResponse::default()
        }
    };

    Ok(vec![Payload::RoomResponse(response)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{context, joined};
    use crate::tunnel::tests::ok_reply;
    use veil_shared::{RoomId, Status};

    fn rooms(out: Vec<Payload>) -> RoomResponse {
        match out.into_iter().next() {
            Some(Payload::RoomResponse(r)) => r,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_browse_quit() {
        let ctx = context();
        let alice = joined(&ctx, "alice", |_| ok_reply()).await;
        let bob = joined(&ctx, "bob", |_| ok_reply()).await;
        let lobby = RoomId::new("lobby");

        let first = rooms(
            handle(&ctx, &alice, RoomRequest::Join { room: lobby.clone() })
                .await
                .unwrap(),
        );
        assert_eq!(first.members.len(), 1);
        let second = rooms(
            handle(&ctx, &bob, RoomRequest::Join { room: lobby.clone() })
                .await
                .unwrap(),
        );
        assert_eq!(second.members.len(), 2);

        let listed = rooms(handle(&ctx, &alice, RoomRequest::Browse).await.unwrap());
        assert_eq!(listed.rooms.len(), 1);
        assert_eq!(listed.rooms[0].members, 2);

        handle(&ctx, &alice, RoomRequest::Quit { room: lobby.clone() })
            .await
            .unwrap();
        handle(&ctx, &bob, RoomRequest::Quit { room: lobby })
            .await
            .unwrap();
        let listed = rooms(handle(&ctx, &alice, RoomRequest::Browse).await.unwrap());
        assert!(listed.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_quit_unknown_room() {
        let ctx = context();
        let alice = joined(&ctx, "alice", |_| ok_reply()).await;
        let err = handle(
            &ctx,
            &alice,
            RoomRequest::Quit {
                room: RoomId::new("nowhere"),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[tokio::test]
    async fn test_empty_room_name_rejected() {
        let ctx = context();
        let alice = joined(&ctx, "alice", |_| ok_reply()).await;
        let err = handle(&ctx, &alice, RoomRequest::Join { room: RoomId::new("") })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
    }
}
