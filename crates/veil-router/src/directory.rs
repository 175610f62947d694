//! Group, room and client directories.
//!
//! Groups are namespaces: each owns its clients and rooms, and members of
//! different groups never see each other. A single index maps every client id
//! to its group. All of it sits behind one `RwLock`; every method takes the
//! lock briefly, copies out what the caller needs, and never awaits I/O while
//! holding it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};
use veil_shared::protocol::{InfoKind, JoinRequest, MemberInfo, Preferences, RoomInfo};
use veil_shared::{ClientId, GroupId, RoomId, SessionId, VeilError};

use crate::tunnel::Tunnel;

#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub color: String,
    pub troll: bool,
    pub verified: bool,
    pub share: bool,
    pub prefs: Preferences,
    pub group: GroupId,
    pub rooms: BTreeSet<RoomId>,
    /// Members whose events this client does not want.
    pub muted: HashSet<ClientId>,
    pub session: SessionId,
    pub tunnel: Option<Tunnel>,
    pub joined: Instant,
}

impl Client {
    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            id: self.id,
            name: self.name.clone(),
            color: self.color.clone(),
            troll: self.troll,
            verified: self.verified,
            share: self.share,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub members: BTreeSet<ClientId>,
}

impl Room {
    fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            name: self.id.0.clone(),
            members: self.members.len() as u32,
        }
    }
}

#[derive(Debug, Default)]
pub struct Group {
    pub clients: HashMap<ClientId, Client>,
    pub rooms: HashMap<RoomId, Room>,
}

impl Group {
    fn members(&self) -> Vec<MemberInfo> {
        let mut members: Vec<MemberInfo> = self.clients.values().map(Client::info).collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn rooms(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self.rooms.values().map(Room::info).collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms
    }

    /// `name`, or `name (2)`, `name (3)`... whichever no other member holds.
    fn unique_name(&self, name: &str, exclude: ClientId) -> String {
        let taken = |candidate: &str| {
            self.clients
                .values()
                .any(|c| c.id != exclude && c.name == candidate)
        };
        if !taken(name) {
            return name.to_string();
        }
        (2u32..)
            .map(|n| format!("{name} ({n})"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| name.to_string())
    }
}

/// Snapshot of a member used by the broadcast scheduler.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: ClientId,
    pub prefs: Preferences,
    pub share: bool,
    /// The recipient muted the sender.
    pub muted: bool,
    pub tunnel: Option<Tunnel>,
}

impl Recipient {
    fn of(client: &Client, sender: ClientId) -> Self {
        Self {
            id: client.id,
            prefs: client.prefs,
            share: client.share,
            muted: client.muted.contains(&sender),
            tunnel: client.tunnel.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub client: ClientId,
    pub member: MemberInfo,
    pub kind: InfoKind,
    pub members: Vec<MemberInfo>,
    pub rooms: Vec<RoomInfo>,
    /// Group the client left to join this one.
    pub left: Option<GroupId>,
}

/// A client removed from the directory, with who should hear about it.
#[derive(Debug, Clone)]
pub struct Departure {
    pub client: Client,
    pub remaining: Vec<Recipient>,
}

#[derive(Default)]
struct DirectoryState {
    groups: HashMap<GroupId, Group>,
    index: HashMap<ClientId, GroupId>,
}

impl DirectoryState {
    fn client(&self, id: &ClientId) -> Option<&Client> {
        let group = self.index.get(id)?;
        self.groups.get(group)?.clients.get(id)
    }

    fn client_mut(&mut self, id: &ClientId) -> Option<&mut Client> {
        let group = self.index.get(id)?;
        self.groups.get_mut(group)?.clients.get_mut(id)
    }

    fn group_of(&self, id: &ClientId) -> Result<(&GroupId, &Group), VeilError> {
        let gid = self
            .index
            .get(id)
            .ok_or_else(|| VeilError::not_found(format!("client {}", id.short())))?;
        let group = self
            .groups
            .get(gid)
            .ok_or_else(|| VeilError::Internal(format!("group {gid} missing")))?;
        Ok((gid, group))
    }

    fn group_of_mut(&mut self, id: &ClientId) -> Result<&mut Group, VeilError> {
        let gid = self
            .index
            .get(id)
            .ok_or_else(|| VeilError::not_found(format!("client {}", id.short())))?;
        self.groups
            .get_mut(gid)
            .ok_or_else(|| VeilError::Internal(format!("group {gid} missing")))
    }

    /// Unlink a client from its group and rooms. Empty rooms go with it.
    fn remove(&mut self, id: &ClientId) -> Option<Client> {
        let gid = self.index.remove(id)?;
        let group = self.groups.get_mut(&gid)?;
        let client = group.clients.remove(id)?;
        for room_id in &client.rooms {
            let empty = match group.rooms.get_mut(room_id) {
                Some(room) => {
                    room.members.remove(id);
                    room.members.is_empty()
                }
                None => false,
            };
            if empty {
                group.rooms.remove(room_id);
            }
        }
        Some(client)
    }
}

#[derive(Clone, Default)]
pub struct Directory {
    state: Arc<RwLock<DirectoryState>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a client in `req.group`.
    ///
    /// `existing` is the client id a migrated session already carries. A
    /// client joining a different group is first removed from its old one.
    pub async fn join(
        &self,
        existing: Option<ClientId>,
        session: &SessionId,
        req: &JoinRequest,
        verified: bool,
    ) -> JoinOutcome {
        let mut state = self.state.write().await;
        let id = existing.unwrap_or_else(ClientId::random);

        let mut left = None;
        let mut prior = None;
        if let Some(old_group) = state.index.get(&id).cloned() {
            if old_group != req.group {
                state.remove(&id);
                left = Some(old_group);
            } else {
                prior = state.client(&id).cloned();
            }
        }

        let group = state.groups.entry(req.group.clone()).or_default();
        let name = group.unique_name(req.name.trim(), id);

        let kind = match &prior {
            Some(p) if p.name != name => InfoKind::Rename,
            Some(_) => InfoKind::Update,
            None => InfoKind::Join,
        };

        let client = Client {
            id,
            name,
            color: req.color.clone(),
            troll: prior.as_ref().map_or(false, |p| p.troll),
            verified,
            share: req.share,
            prefs: req.prefs,
            group: req.group.clone(),
            rooms: prior.as_ref().map(|p| p.rooms.clone()).unwrap_or_default(),
            muted: prior.as_ref().map(|p| p.muted.clone()).unwrap_or_default(),
            session: session.clone(),
            tunnel: prior.as_ref().and_then(|p| p.tunnel.clone()),
            joined: prior.as_ref().map_or_else(Instant::now, |p| p.joined),
        };
        let member = client.info();
        group.clients.insert(id, client);
        let members = group.members();
        let rooms = group.rooms();
        state.index.insert(id, req.group.clone());

        JoinOutcome {
            client: id,
            member,
            kind,
            members,
            rooms,
            left,
        }
    }

    /// Remove a client everywhere and close its tunnel.
    pub async fn leave(&self, id: &ClientId) -> Option<Departure> {
        let mut state = self.state.write().await;
        let client = state.remove(id)?;
        if let Some(tunnel) = &client.tunnel {
            tunnel.close();
        }
        let remaining = state
            .groups
            .get(&client.group)
            .map(|g| g.clients.values().map(|c| Recipient::of(c, *id)).collect())
            .unwrap_or_default();
        info!(client = %id.short(), name = %client.name, "Client left");
        Some(Departure { client, remaining })
    }

    /// Attach the relay channel. An older tunnel for the same client is closed.
    pub async fn set_tunnel(&self, id: &ClientId, tunnel: Tunnel) -> Result<(), VeilError> {
        let mut state = self.state.write().await;
        let client = state
            .client_mut(id)
            .ok_or_else(|| VeilError::not_found(format!("client {}", id.short())))?;
        if let Some(old) = client.tunnel.replace(tunnel) {
            old.close();
        }
        debug!(client = %id.short(), "Tunnel attached");
        Ok(())
    }

    /// Detach `tunnel` if it is still the client's current one.
    pub async fn clear_tunnel(&self, id: &ClientId, tunnel: &Tunnel) -> bool {
        let mut state = self.state.write().await;
        match state.client_mut(id) {
            Some(client) if client.tunnel.as_ref().map_or(false, |t| t.same(tunnel)) => {
                client.tunnel = None;
                true
            }
            _ => false,
        }
    }

    pub async fn tunnel_of(&self, id: &ClientId) -> Option<Tunnel> {
        let state = self.state.read().await;
        state.client(id).and_then(|c| c.tunnel.clone())
    }

    pub async fn member(&self, id: &ClientId) -> Option<MemberInfo> {
        let state = self.state.read().await;
        state.client(id).map(Client::info)
    }

    pub async fn contains(&self, id: &ClientId) -> bool {
        self.state.read().await.index.contains_key(id)
    }

    /// Every member of the sender's group, the sender included.
    pub async fn group_recipients(&self, sender: &ClientId) -> Result<Vec<Recipient>, VeilError> {
        let state = self.state.read().await;
        let (_, group) = state.group_of(sender)?;
        Ok(group
            .clients
            .values()
            .map(|c| Recipient::of(c, *sender))
            .collect())
    }

    /// Members of `room` in the sender's group. The sender must be in it.
    pub async fn room_recipients(
        &self,
        sender: &ClientId,
        room: &RoomId,
    ) -> Result<Vec<Recipient>, VeilError> {
        let state = self.state.read().await;
        let (_, group) = state.group_of(sender)?;
        let room = group
            .rooms
            .get(room)
            .ok_or_else(|| VeilError::not_found(format!("room {room}")))?;
        if !room.members.contains(sender) {
            return Err(VeilError::validation(format!("not a member of room {}", room.id)));
        }
        Ok(room
            .members
            .iter()
            .filter_map(|id| group.clients.get(id))
            .map(|c| Recipient::of(c, *sender))
            .collect())
    }

    /// Members of an arbitrary group, as seen by `sender`.
    pub async fn members_of(&self, group: &GroupId, sender: &ClientId) -> Vec<Recipient> {
        let state = self.state.read().await;
        state
            .groups
            .get(group)
            .map(|g| g.clients.values().map(|c| Recipient::of(c, *sender)).collect())
            .unwrap_or_default()
    }

    /// Specific members of the sender's group.
    pub async fn recipients(
        &self,
        sender: &ClientId,
        targets: &[ClientId],
    ) -> Result<Vec<Recipient>, VeilError> {
        let state = self.state.read().await;
        let (_, group) = state.group_of(sender)?;
        targets
            .iter()
            .map(|t| {
                group
                    .clients
                    .get(t)
                    .map(|c| Recipient::of(c, *sender))
                    .ok_or_else(|| VeilError::not_found(format!("client {}", t.short())))
            })
            .collect()
    }

    pub async fn room_browse(&self, id: &ClientId) -> Result<Vec<RoomInfo>, VeilError> {
        let state = self.state.read().await;
        let (_, group) = state.group_of(id)?;
        Ok(group.rooms())
    }

    /// Join (creating if needed) a room. Returns the room's members.
    pub async fn room_join(
        &self,
        id: &ClientId,
        room_id: &RoomId,
    ) -> Result<Vec<MemberInfo>, VeilError> {
        let mut state = self.state.write().await;
        let group = state.group_of_mut(id)?;
        let room = group.rooms.entry(room_id.clone()).or_insert_with(|| Room {
            id: room_id.clone(),
            members: BTreeSet::new(),
        });
        room.members.insert(*id);
        let member_ids: Vec<ClientId> = room.members.iter().copied().collect();
        if let Some(client) = group.clients.get_mut(id) {
            client.rooms.insert(room_id.clone());
        }
        Ok(member_ids
            .iter()
            .filter_map(|m| group.clients.get(m))
            .map(Client::info)
            .collect())
    }

    /// Leave a room; an emptied room is removed.
    pub async fn room_quit(&self, id: &ClientId, room_id: &RoomId) -> Result<(), VeilError> {
        let mut state = self.state.write().await;
        let group = state.group_of_mut(id)?;
        let room = group
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| VeilError::not_found(format!("room {room_id}")))?;
        if !room.members.remove(id) {
            return Err(VeilError::not_found(format!("not in room {room_id}")));
        }
        if room.members.is_empty() {
            group.rooms.remove(room_id);
        }
        if let Some(client) = group.clients.get_mut(id) {
            client.rooms.remove(room_id);
        }
        Ok(())
    }

    pub async fn mute(&self, id: &ClientId, target: &ClientId, mute: bool) -> Result<(), VeilError> {
        let mut state = self.state.write().await;
        let group = state.group_of_mut(id)?;
        if !group.clients.contains_key(target) {
            return Err(VeilError::not_found(format!("client {}", target.short())));
        }
        let client = group
            .clients
            .get_mut(id)
            .ok_or_else(|| VeilError::not_found(format!("client {}", id.short())))?;
        if mute {
            client.muted.insert(*target);
        } else {
            client.muted.remove(target);
        }
        Ok(())
    }

    pub async fn set_troll(&self, id: &ClientId, troll: bool) -> Option<MemberInfo> {
        let mut state = self.state.write().await;
        let client = state.client_mut(id)?;
        client.troll = troll;
        Some(client.info())
    }

    /// Every open relay channel, for the keepalive sweep.
    pub async fn tunnels(&self) -> Vec<Tunnel> {
        let state = self.state.read().await;
        state
            .groups
            .values()
            .flat_map(|g| g.clients.values())
            .filter_map(|c| c.tunnel.clone())
            .collect()
    }

    /// Clients that joined more than `grace` ago and still have no tunnel.
    pub async fn without_tunnel(&self, grace: Duration) -> Vec<ClientId> {
        let state = self.state.read().await;
        let now = Instant::now();
        state
            .groups
            .values()
            .flat_map(|g| g.clients.values())
            .filter(|c| c.tunnel.is_none() && now.duration_since(c.joined) >= grace)
            .map(|c| c.id)
            .collect()
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.index.len()
    }
}
