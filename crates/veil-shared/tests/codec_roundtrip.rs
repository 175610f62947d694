//! Property tests for the wire codec: every payload set survives pack/unpack.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;
use proptest::strategy::ValueTree;
use uuid::Uuid;
use veil_shared::chunk::{Chunk, ChunkRange};
use veil_shared::protocol::*;
use veil_shared::{
    pack, unpack, ClientId, GroupId, Payload, RoomId, RouterType, SessionId, Status, TransferId,
};

fn arb_text() -> impl Strategy<Value = String> {
    ".{0,24}"
}

fn arb_client() -> impl Strategy<Value = ClientId> {
    any::<[u8; 16]>().prop_map(ClientId)
}

fn arb_session() -> impl Strategy<Value = SessionId> {
    "[0-9a-f]{32}".prop_map(SessionId)
}

fn arb_transfer() -> impl Strategy<Value = TransferId> {
    any::<[u8; 16]>().prop_map(|b| TransferId(Uuid::from_bytes(b)))
}

fn arb_room() -> impl Strategy<Value = RoomId> {
    arb_text().prop_map(RoomId)
}

fn arb_status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Ok),
        Just(Status::BadRequest),
        Just(Status::NotFound),
        Just(Status::NotImplemented),
        Just(Status::InternalServerError),
        Just(Status::ServiceUnavailable),
        Just(Status::None),
    ]
}

fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_000_000_000, 0u32..1_000_000_000)
        .prop_filter_map("timestamp in range", |(secs, nanos)| {
            DateTime::<Utc>::from_timestamp(secs, nanos)
        })
}

fn arb_range() -> impl Strategy<Value = ChunkRange> {
    (any::<u64>(), any::<u64>(), any::<u64>()).prop_map(|(offset, size, sequence)| ChunkRange {
        offset,
        size,
        sequence,
    })
}

fn arb_chunk() -> impl Strategy<Value = Chunk> {
    (any::<u64>(), vec(any::<u8>(), 0..32), any::<u64>(), any::<bool>()).prop_map(
        |(offset, data, sequence, acked)| Chunk {
            offset,
            size: data.len() as u64,
            data,
            sequence,
            acked,
        },
    )
}

fn arb_member() -> impl Strategy<Value = MemberInfo> {
    (
        arb_client(),
        arb_text(),
        arb_text(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(id, name, color, troll, verified, share)| MemberInfo {
            id,
            name,
            color,
            troll,
            verified,
            share,
        })
}

fn arb_room_info() -> impl Strategy<Value = RoomInfo> {
    (arb_room(), arb_text(), any::<u32>()).prop_map(|(id, name, members)| RoomInfo { id, name, members })
}

fn arb_file() -> impl Strategy<Value = FileInfo> {
    (arb_text(), any::<u64>()).prop_map(|(path, size)| FileInfo { path, size })
}

fn arb_room_request() -> impl Strategy<Value = RoomRequest> {
    prop_oneof![
        Just(RoomRequest::Browse),
        arb_room().prop_map(|room| RoomRequest::Join { room }),
        arb_room().prop_map(|room| RoomRequest::Quit { room }),
    ]
}

fn arb_handshake() -> impl Strategy<Value = HandshakeRequest> {
    let kdf = (arb_text(), vec(any::<u8>(), 0..16), any::<u32>())
        .prop_map(|(hash, salt, iterations)| KdfParams { hash, salt, iterations });
    (
        prop_oneof![Just(RouterType::Message), Just(RouterType::Transfer)],
        arb_text(),
        any::<u32>(),
        any::<u32>(),
        vec(any::<u8>(), 0..40),
        arb_text(),
        any::<u32>(),
        option::of(kdf),
        option::of(arb_session()),
    )
        .prop_map(
            |(router_type, group, prime_size, generator, public_key, cipher, key_size, kdf, session_id)| {
                HandshakeRequest {
                    router_type,
                    group,
                    prime_size,
                    generator,
                    public_key,
                    cipher,
                    key_size,
                    kdf,
                    session_id,
                }
            },
        )
}

fn arb_request() -> impl Strategy<Value = Payload> {
    prop_oneof![
        arb_handshake().prop_map(Payload::HandshakeRequest),
        (
            arb_text(),
            arb_text(),
            arb_text(),
            option::of(arb_text()),
            any::<bool>(),
            any::<(bool, bool)>(),
        )
            .prop_map(|(name, color, group, passphrase, share, (chat, transfer))| {
                Payload::JoinRequest(JoinRequest {
                    name,
                    color,
                    group: GroupId(group),
                    passphrase,
                    share,
                    prefs: Preferences { chat, transfer },
                })
            }),
        any::<bool>().prop_map(|reverse| Payload::PingRequest(PingRequest { reverse })),
        arb_room_request().prop_map(Payload::RoomRequest),
        (arb_client(), any::<bool>())
            .prop_map(|(client, mute)| Payload::MuteRequest(MuteRequest { client, mute })),
        (arb_text(), option::of(arb_room()), arb_timestamp()).prop_map(|(text, room, timestamp)| {
            Payload::ChatRequest(ChatRequest {
                text,
                room,
                timestamp,
            })
        }),
        arb_text().prop_map(|path| Payload::BrowseRequest(BrowseRequest { path })),
        arb_text().prop_map(|keyword| Payload::SearchRequest(SearchRequest { keyword })),
        (arb_transfer(), arb_file())
            .prop_map(|(transfer, file)| Payload::TransferRequest(TransferRequest { transfer, file })),
    ]
}

fn arb_response() -> impl Strategy<Value = Payload> {
    prop_oneof![
        (vec(any::<u8>(), 0..40), arb_session()).prop_map(|(public_key, session_id)| {
            Payload::HandshakeResponse(HandshakeResponse {
                public_key,
                session_id,
            })
        }),
        (
            arb_client(),
            arb_text(),
            arb_text(),
            vec(arb_member(), 0..4),
            vec(arb_room_info(), 0..4),
        )
            .prop_map(|(client, name, motd, members, rooms)| {
                Payload::JoinResponse(JoinResponse {
                    client,
                    name,
                    motd,
                    members,
                    rooms,
                })
            }),
        option::of(arb_status()).prop_map(|reverse| Payload::PingResponse(PingResponse { reverse })),
        (vec(arb_room_info(), 0..4), vec(arb_member(), 0..4))
            .prop_map(|(rooms, members)| Payload::RoomResponse(RoomResponse { rooms, members })),
        vec(arb_file(), 0..4).prop_map(|files| Payload::BrowseResponse(BrowseResponse { files })),
        (arb_text(), vec(arb_file(), 0..4))
            .prop_map(|(keyword, files)| Payload::SearchResponse(SearchResponse { keyword, files })),
        (arb_transfer(), any::<u64>()).prop_map(|(transfer, chunk_size)| {
            Payload::TransferResponse(TransferResponse {
                transfer,
                chunk_size,
            })
        }),
        (any::<bool>(), option::of(arb_range()), any::<bool>()).prop_map(|(accepted, range, done)| {
            Payload::UploadResponse(UploadResponse {
                accepted,
                range,
                done,
            })
        }),
        (option::of(arb_chunk()), any::<bool>())
            .prop_map(|(chunk, done)| Payload::DownloadResponse(DownloadResponse { chunk, done })),
    ]
}

fn arb_transfer_or_event() -> impl Strategy<Value = Payload> {
    prop_oneof![
        (arb_transfer(), any::<u64>(), option::of(arb_chunk())).prop_map(
            |(transfer, file_size, chunk)| {
                Payload::UploadRequest(UploadRequest {
                    transfer,
                    file_size,
                    chunk,
                })
            }
        ),
        (arb_transfer(), any::<u64>(), vec(arb_range(), 0..4)).prop_map(
            |(transfer, file_size, acks)| {
                Payload::DownloadRequest(DownloadRequest {
                    transfer,
                    file_size,
                    acks,
                })
            }
        ),
        arb_session().prop_map(|session| Payload::TunnelRequest(TunnelRequest { session })),
        Just(Payload::QuitRequest(QuitRequest {})),
        (
            prop_oneof![
                Just(InfoKind::Join),
                Just(InfoKind::Leave),
                Just(InfoKind::Rename),
                Just(InfoKind::Update),
            ],
            arb_member(),
            option::of(arb_room()),
        )
            .prop_map(|(kind, member, room)| Payload::Info(InfoEvent { kind, member, room })),
    ]
}

fn arb_payload() -> impl Strategy<Value = Payload> {
    prop_oneof![arb_request(), arb_response(), arb_transfer_or_event()]
}

proptest! {
    #[test]
    fn any_payload_set_roundtrips(payloads in vec(arb_payload(), 0..8)) {
        let packed = pack(&payloads).unwrap();
        prop_assert_eq!(unpack(&packed).unwrap(), payloads);
    }
}

#[test]
fn test_every_payload_type_roundtrips() {
    let mut runner = proptest::test_runner::TestRunner::deterministic();
    let mut payloads: Vec<Payload> = Vec::new();
    let mut seen: HashSet<u8> = HashSet::new();
    while seen.len() < 23 {
        let payload = arb_payload().new_tree(&mut runner).unwrap().current();
        if seen.insert(payload.kind() as u8) {
            payloads.push(payload);
        }
    }
    assert!((0x01u8..=0x17).all(|tag| seen.contains(&tag)));

    let unpacked = unpack(&pack(&payloads).unwrap()).unwrap();
    assert_eq!(unpacked, payloads);
}
