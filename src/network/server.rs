//! Control server
//!
//! Keeps the group/user model and tells every client about the other
//! members of its groups. The server never touches audio. On its UDP port
//! it answers public address queries and, when enabled, forwards relay
//! packets between clients that cannot reach each other directly.
//!
//! [`ServerState`] is the whole model as a plain state machine: requests go
//! in, messages for clients come out of an outbox. [`Server`] drives it
//! from the TCP and UDP servers and from the [`ServerHandle`] admin API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::events::{
    ClientLoginEvent, Event, EventMode, EventQueue, GroupEvent, GroupMemberEvent,
    MetadataUpdateEvent, ThreadLevel,
};
use crate::protocol::binary;
use crate::protocol::control::parse_control_address;
use crate::protocol::messages::{cmd, query_reply};
use crate::protocol::{
    check_version, route, write_frame, ClientRequest, ErrorCode, ErrorReply, FrameDecoder,
    GroupJoinReply, LoginReply, OscMessage, PeerAnnouncement, ServerMessage, Target,
};

use super::addr::{IpAddress, SocketFamily};
use super::error::NetworkError;
use super::tcp_server::{ClientId, TcpEvent, TcpServer, TcpStopHandle};
use super::udp_server::{Received, UdpServer, UdpServerConfig};

/// Default port for both TCP and UDP
pub const DEFAULT_PORT: u16 = 7078;

/// Errors that stop the server or fail an admin request
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind server socket: {0}")]
    Bind(#[source] NetworkError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Group already exists: {0}")]
    GroupExists(String),

    #[error("Group not found: {0}")]
    GroupNotFound(i32),

    #[error("User {user_id} not found in group {group_id}")]
    UserNotFound { group_id: i32, user_id: i32 },

    #[error("Server stopped")]
    Stopped,
}

/// Configuration for [`Server`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub family: SocketFamily,
    /// Password required at login
    pub password: Option<String>,
    /// Create unknown groups on join instead of failing
    pub group_auto_create: bool,
    /// Keep auto-created groups (and their users) when the last member leaves
    pub persistent_groups: bool,
    /// Forward relay packets for clients without direct connectivity
    pub server_relay: bool,
}

impl ServerConfig {
    pub fn validated(self) -> Self {
        Self {
            password: self.password.filter(|p| !p.is_empty()),
            ..self
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            family: SocketFamily::DualStack,
            password: None,
            group_auto_create: true,
            persistent_groups: false,
            server_relay: false,
        }
    }
}

/// Snapshot of the server model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub clients: usize,
    pub groups: usize,
    /// Users currently connected to a group
    pub members: usize,
}

#[derive(Debug)]
struct User {
    id: i32,
    name: String,
    password: String,
    metadata: Option<Vec<u8>>,
    client: Option<ClientId>,
    addresses: Vec<SocketAddr>,
}

#[derive(Debug)]
struct Group {
    id: i32,
    name: String,
    password: String,
    metadata: Option<Vec<u8>>,
    users: Vec<User>,
    persistent: bool,
    next_user_id: i32,
}

impl Group {
    fn user(&self, id: i32) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    fn user_mut(&mut self, id: i32) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    /// Connected members other than `except`
    fn online_except(&self, except: i32) -> impl Iterator<Item = (i32, ClientId)> + '_ {
        self.users
            .iter()
            .filter(move |u| u.id != except)
            .filter_map(|u| u.client.map(|c| (u.id, c)))
    }

    fn announce(&self, user: &User) -> PeerAnnouncement {
        PeerAnnouncement {
            group_id: self.id,
            group_name: self.name.clone(),
            user_id: user.id,
            user_name: user.name.clone(),
            metadata: user.metadata.clone(),
            addresses: user.addresses.clone(),
        }
    }
}

#[derive(Debug)]
struct ClientInfo {
    addr: SocketAddr,
    logged_in: bool,
    /// (group id, user id)
    memberships: Vec<(i32, i32)>,
}

fn error(code: ErrorCode, message: &str) -> ErrorReply {
    ErrorReply::new(code, message)
}

/// Group/user model of the server
pub struct ServerState {
    config: ServerConfig,
    groups: HashMap<i32, Group>,
    clients: HashMap<ClientId, ClientInfo>,
    next_group_id: i32,
    events: Arc<EventQueue>,
    outbox: Vec<(ClientId, ServerMessage)>,
}

impl ServerState {
    pub fn new(config: ServerConfig, events: Arc<EventQueue>) -> Self {
        Self {
            config: config.validated(),
            groups: HashMap::new(),
            clients: HashMap::new(),
            next_group_id: 1,
            events,
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Messages produced since the last call, in order
    pub fn take_outbox(&mut self) -> Vec<(ClientId, ServerMessage)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            clients: self.clients.len(),
            groups: self.groups.len(),
            members: self
                .groups
                .values()
                .flat_map(|g| g.users.iter())
                .filter(|u| u.client.is_some())
                .count(),
        }
    }

    pub fn group_id(&self, name: &str) -> Option<i32> {
        self.groups.values().find(|g| g.name == name).map(|g| g.id)
    }

    pub fn add_client(&mut self, id: ClientId, addr: SocketAddr) {
        debug!("Client {} connected from {}", id, addr);
        self.clients.insert(
            id,
            ClientInfo {
                addr,
                logged_in: false,
                memberships: Vec::new(),
            },
        );
    }

    /// Forget a client and take it out of every group it joined
    pub fn remove_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        for (group_id, user_id) in client.memberships {
            self.remove_member(group_id, user_id, id);
        }
        if client.logged_in {
            info!("Client {} ({}) logged out", id, client.addr);
            self.events
                .push(Event::ClientLogout { client_id: id }, ThreadLevel::Network);
        }
    }

    pub fn handle_request(&mut self, client_id: ClientId, request: ClientRequest) {
        match request {
            ClientRequest::Login {
                token,
                version,
                password,
                ..
            } => {
                let result = self.login(client_id, &version, &password);
                self.outbox
                    .push((client_id, ServerMessage::Login { token, result }));
            }
            ClientRequest::GroupJoin {
                token,
                group_name,
                group_password,
                user_name,
                user_password,
                group_metadata,
                user_metadata,
                addresses,
            } => {
                let result = self.group_join(
                    client_id,
                    group_name,
                    group_password,
                    user_name,
                    user_password,
                    group_metadata,
                    user_metadata,
                    addresses,
                );
                let joined = result.as_ref().ok().map(|r| (r.group_id, r.user_id));
                self.outbox
                    .push((client_id, ServerMessage::GroupJoin { token, result }));
                if let Some((group_id, user_id)) = joined {
                    self.announce_join(client_id, group_id, user_id);
                }
            }
            ClientRequest::GroupLeave { token, group_id } => {
                let result = self.group_leave(client_id, group_id);
                self.outbox
                    .push((client_id, ServerMessage::GroupLeave { token, result }));
            }
            ClientRequest::GroupUpdate {
                token,
                group_id,
                metadata,
            } => {
                let result = self.group_update(client_id, group_id, metadata);
                self.outbox
                    .push((client_id, ServerMessage::GroupUpdate { token, result }));
            }
            ClientRequest::UserUpdate {
                token,
                group_id,
                metadata,
            } => {
                let result = self.user_update(client_id, group_id, metadata);
                self.outbox
                    .push((client_id, ServerMessage::UserUpdate { token, result }));
            }
            ClientRequest::Message {
                group_id,
                target,
                flags,
                data,
            } => self.message(client_id, group_id, target, flags, data),
            ClientRequest::Ping { token } => {
                self.outbox.push((client_id, ServerMessage::Pong { token }));
            }
        }
    }

    fn login(
        &mut self,
        client_id: ClientId,
        version: &str,
        password: &str,
    ) -> Result<LoginReply, ErrorReply> {
        let relay = self.config.server_relay;
        let required = self.config.password.clone();
        let client = self
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| error(ErrorCode::Unspecified, "unknown client"))?;
        let addr = client.addr;
        let result = if client.logged_in {
            Err(error(ErrorCode::AlreadyLoggedIn, "already logged in"))
        } else if !check_version(version) {
            Err(error(ErrorCode::VersionMismatch, version))
        } else if required.is_some_and(|p| p != password) {
            Err(error(ErrorCode::WrongPassword, "wrong server password"))
        } else {
            client.logged_in = true;
            Ok(LoginReply { client_id, relay })
        };

        match &result {
            Ok(_) => info!("Client {} ({}) logged in", client_id, addr),
            Err(e) => warn!("Login of client {} ({}) failed: {}", client_id, addr, e),
        }
        if !matches!(&result, Err(e) if e.code == ErrorCode::AlreadyLoggedIn) {
            self.events.push(
                Event::ClientLogin(ClientLoginEvent {
                    client_id,
                    address: addr,
                    accepted: result.is_ok(),
                }),
                ThreadLevel::Network,
            );
        }
        result
    }

    fn create_group(
        &mut self,
        name: String,
        password: String,
        metadata: Option<Vec<u8>>,
        persistent: bool,
    ) -> i32 {
        let id = self.next_group_id;
        self.next_group_id += 1;
        info!("Group {} '{}' created", id, name);
        self.events.push(
            Event::GroupAdd(GroupEvent {
                group_id: id,
                name: name.clone(),
            }),
            ThreadLevel::Network,
        );
        self.groups.insert(
            id,
            Group {
                id,
                name,
                password,
                metadata,
                users: Vec::new(),
                persistent,
                next_user_id: 0,
            },
        );
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn group_join(
        &mut self,
        client_id: ClientId,
        group_name: String,
        group_password: String,
        user_name: String,
        user_password: String,
        group_metadata: Option<Vec<u8>>,
        user_metadata: Option<Vec<u8>>,
        addresses: Vec<SocketAddr>,
    ) -> Result<GroupJoinReply, ErrorReply> {
        match self.clients.get(&client_id) {
            Some(client) if client.logged_in => {}
            _ => return Err(error(ErrorCode::NotLoggedIn, "not logged in")),
        }
        let group_id = match self.group_id(&group_name) {
            Some(id) => id,
            None if self.config.group_auto_create => {
                let persistent = self.config.persistent_groups;
                self.create_group(group_name.clone(), group_password.clone(), group_metadata, persistent)
            }
            None => return Err(error(ErrorCode::GroupNotFound, &group_name)),
        };

        let Some(group) = self.groups.get_mut(&group_id) else {
            return Err(error(ErrorCode::GroupNotFound, &group_name));
        };
        if !group.password.is_empty() && group.password != group_password {
            return Err(error(ErrorCode::WrongPassword, "wrong group password"));
        }
        let Some(client) = self.clients.get_mut(&client_id) else {
            return Err(error(ErrorCode::NotLoggedIn, "not logged in"));
        };
        if client.memberships.iter().any(|(g, _)| *g == group_id) {
            return Err(error(ErrorCode::AlreadyMember, &group_name));
        }

        let user_id = match group.users.iter_mut().find(|u| u.name == user_name) {
            Some(user) if user.client.is_some() => {
                return Err(error(ErrorCode::UserAlreadyExists, &user_name));
            }
            Some(user) => {
                if !user.password.is_empty() && user.password != user_password {
                    return Err(error(ErrorCode::WrongPassword, "wrong user password"));
                }
                user.client = Some(client_id);
                user.addresses = addresses;
                if user_metadata.is_some() {
                    user.metadata = user_metadata;
                }
                user.id
            }
            None => {
                let id = group.next_user_id;
                group.next_user_id += 1;
                group.users.push(User {
                    id,
                    name: user_name.clone(),
                    password: user_password,
                    metadata: user_metadata,
                    client: Some(client_id),
                    addresses,
                });
                id
            }
        };
        client.memberships.push((group_id, user_id));

        info!(
            "User {} '{}' (client {}) joined group {} '{}'",
            user_id, user_name, client_id, group_id, group.name
        );
        self.events.push(
            Event::GroupJoin(GroupMemberEvent {
                group_id,
                user_id,
                user_name,
                client_id,
            }),
            ThreadLevel::Network,
        );
        Ok(GroupJoinReply {
            group_id,
            user_id,
            group_metadata: group.metadata.clone(),
        })
    }

    /// Introduce a new member and the existing members to each other
    fn announce_join(&mut self, client_id: ClientId, group_id: i32, user_id: i32) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        let Some(joined) = group.user(user_id) else {
            return;
        };
        let announcement = group.announce(joined);
        for (other_id, other_client) in group.online_except(user_id) {
            self.outbox
                .push((other_client, ServerMessage::PeerJoin(announcement.clone())));
            if let Some(other) = group.user(other_id) {
                self.outbox
                    .push((client_id, ServerMessage::PeerJoin(group.announce(other))));
            }
        }
    }

    fn group_leave(&mut self, client_id: ClientId, group_id: i32) -> Result<(), ErrorReply> {
        let client = self
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| error(ErrorCode::NotLoggedIn, "not logged in"))?;
        let index = client
            .memberships
            .iter()
            .position(|(g, _)| *g == group_id)
            .ok_or_else(|| error(ErrorCode::NotMember, "not a member of this group"))?;
        let (_, user_id) = client.memberships.remove(index);
        self.remove_member(group_id, user_id, client_id);
        Ok(())
    }

    fn remove_member(&mut self, group_id: i32, user_id: i32, client_id: ClientId) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        let Some(index) = group.users.iter().position(|u| u.id == user_id) else {
            return;
        };
        let user_name = group.users[index].name.clone();
        if group.persistent {
            let user = &mut group.users[index];
            user.client = None;
            user.addresses.clear();
        } else {
            group.users.remove(index);
        }
        for (_, other) in group.online_except(user_id) {
            self.outbox
                .push((other, ServerMessage::PeerLeave { group_id, user_id }));
        }
        info!(
            "User {} '{}' (client {}) left group {} '{}'",
            user_id, user_name, client_id, group_id, group.name
        );
        self.events.push(
            Event::GroupLeave(GroupMemberEvent {
                group_id,
                user_id,
                user_name,
                client_id,
            }),
            ThreadLevel::Network,
        );

        if !group.persistent && group.users.iter().all(|u| u.client.is_none()) {
            let name = group.name.clone();
            self.groups.remove(&group_id);
            info!("Group {} '{}' removed (empty)", group_id, name);
            self.events.push(
                Event::GroupRemove(GroupEvent { group_id, name }),
                ThreadLevel::Network,
            );
        }
    }

    fn membership(&self, client_id: ClientId, group_id: i32) -> Result<i32, ErrorReply> {
        self.clients
            .get(&client_id)
            .and_then(|c| c.memberships.iter().find(|(g, _)| *g == group_id))
            .map(|(_, u)| *u)
            .ok_or_else(|| error(ErrorCode::NotMember, "not a member of this group"))
    }

    fn group_update(
        &mut self,
        client_id: ClientId,
        group_id: i32,
        metadata: Vec<u8>,
    ) -> Result<(), ErrorReply> {
        let user_id = self.membership(client_id, group_id)?;
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| error(ErrorCode::GroupNotFound, "group not found"))?;
        group.metadata = Some(metadata.clone());
        for (_, other) in group.online_except(user_id) {
            self.outbox.push((
                other,
                ServerMessage::GroupChanged {
                    group_id,
                    user_id,
                    metadata: metadata.clone(),
                },
            ));
        }
        self.events.push(
            Event::GroupUpdate(MetadataUpdateEvent {
                group_id,
                user_id,
                metadata,
            }),
            ThreadLevel::Network,
        );
        Ok(())
    }

    fn user_update(
        &mut self,
        client_id: ClientId,
        group_id: i32,
        metadata: Vec<u8>,
    ) -> Result<(), ErrorReply> {
        let user_id = self.membership(client_id, group_id)?;
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| error(ErrorCode::GroupNotFound, "group not found"))?;
        let user = group
            .user_mut(user_id)
            .ok_or_else(|| error(ErrorCode::UserNotFound, "user not found"))?;
        user.metadata = Some(metadata.clone());
        for (_, other) in group.online_except(user_id) {
            self.outbox.push((
                other,
                ServerMessage::PeerUpdate {
                    group_id,
                    user_id,
                    metadata: metadata.clone(),
                },
            ));
        }
        self.events.push(
            Event::UserUpdate(MetadataUpdateEvent {
                group_id,
                user_id,
                metadata,
            }),
            ThreadLevel::Network,
        );
        Ok(())
    }

    fn message(&mut self, client_id: ClientId, group_id: i32, target: i32, flags: i32, data: Vec<u8>) {
        let Ok(user_id) = self.membership(client_id, group_id) else {
            debug!("Client {} sent a message to foreign group {}", client_id, group_id);
            return;
        };
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        let mut delivered = 0;
        for (other_id, other) in group.online_except(user_id) {
            if target >= 0 && other_id != target {
                continue;
            }
            self.outbox.push((
                other,
                ServerMessage::Message {
                    group_id,
                    user_id,
                    flags,
                    data: data.clone(),
                },
            ));
            delivered += 1;
        }
        trace!(
            "Message from user {} in group {} delivered to {} member(s)",
            user_id,
            group_id,
            delivered
        );
    }

    /// Create a group that persists without members
    pub fn add_group(
        &mut self,
        name: &str,
        password: &str,
        metadata: Option<Vec<u8>>,
    ) -> Result<i32, ServerError> {
        if self.group_id(name).is_some() {
            return Err(ServerError::GroupExists(name.to_string()));
        }
        Ok(self.create_group(name.to_string(), password.to_string(), metadata, true))
    }

    /// Delete a group, ejecting its members
    pub fn remove_group(&mut self, group_id: i32) -> Result<(), ServerError> {
        let group = self
            .groups
            .remove(&group_id)
            .ok_or(ServerError::GroupNotFound(group_id))?;
        for user in &group.users {
            let Some(client_id) = user.client else {
                continue;
            };
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.memberships.retain(|(g, _)| *g != group_id);
            }
            self.outbox
                .push((client_id, ServerMessage::GroupEject { group_id }));
        }
        info!("Group {} '{}' removed", group_id, group.name);
        self.events.push(
            Event::GroupRemove(GroupEvent {
                group_id,
                name: group.name,
            }),
            ThreadLevel::Network,
        );
        Ok(())
    }

    /// Replace group metadata on behalf of the server
    pub fn update_group(&mut self, group_id: i32, metadata: Vec<u8>) -> Result<(), ServerError> {
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or(ServerError::GroupNotFound(group_id))?;
        group.metadata = Some(metadata.clone());
        for (_, client) in group.online_except(-1) {
            self.outbox.push((
                client,
                ServerMessage::GroupChanged {
                    group_id,
                    user_id: -1,
                    metadata: metadata.clone(),
                },
            ));
        }
        self.events.push(
            Event::GroupUpdate(MetadataUpdateEvent {
                group_id,
                user_id: -1,
                metadata,
            }),
            ThreadLevel::Network,
        );
        Ok(())
    }

    /// Replace user metadata on behalf of the server
    pub fn update_user(
        &mut self,
        group_id: i32,
        user_id: i32,
        metadata: Vec<u8>,
    ) -> Result<(), ServerError> {
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or(ServerError::GroupNotFound(group_id))?;
        let user = group
            .user_mut(user_id)
            .ok_or(ServerError::UserNotFound { group_id, user_id })?;
        user.metadata = Some(metadata.clone());
        if let Some(client) = user.client {
            self.outbox.push((
                client,
                ServerMessage::UserChanged {
                    group_id,
                    user_id,
                    metadata: metadata.clone(),
                },
            ));
        }
        for (_, other) in group.online_except(user_id) {
            self.outbox.push((
                other,
                ServerMessage::PeerUpdate {
                    group_id,
                    user_id,
                    metadata: metadata.clone(),
                },
            ));
        }
        self.events.push(
            Event::UserUpdate(MetadataUpdateEvent {
                group_id,
                user_id,
                metadata,
            }),
            ThreadLevel::Network,
        );
        Ok(())
    }

    /// Send a notification to one client, or to every logged-in client
    pub fn notify(&mut self, client_id: Option<ClientId>, data: Vec<u8>) {
        for (&id, client) in &self.clients {
            if client.logged_in && client_id.map_or(true, |c| c == id) {
                self.outbox
                    .push((id, ServerMessage::Notification { data: data.clone() }));
            }
        }
    }
}

enum Command {
    AddGroup {
        name: String,
        password: String,
        metadata: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<i32, ServerError>>,
    },
    RemoveGroup {
        group_id: i32,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    UpdateGroup {
        group_id: i32,
        metadata: Vec<u8>,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    UpdateUser {
        group_id: i32,
        user_id: i32,
        metadata: Vec<u8>,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Notify {
        client_id: Option<ClientId>,
        data: Vec<u8>,
    },
    Stats {
        reply: oneshot::Sender<Result<ServerStats, ServerError>>,
    },
}

/// Controls a running [`Server`] from other tasks
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<Command>,
    tcp_stop: TcpStopHandle,
    udp: Arc<UdpServer>,
    events: Arc<EventQueue>,
}

impl ServerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, ServerError>>) -> Command,
    ) -> Result<T, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| ServerError::Stopped)?;
        rx.await.map_err(|_| ServerError::Stopped)?
    }

    pub async fn add_group(
        &self,
        name: &str,
        password: &str,
        metadata: Option<Vec<u8>>,
    ) -> Result<i32, ServerError> {
        let (name, password) = (name.to_string(), password.to_string());
        self.request(|reply| Command::AddGroup {
            name,
            password,
            metadata,
            reply,
        })
        .await
    }

    pub async fn remove_group(&self, group_id: i32) -> Result<(), ServerError> {
        self.request(|reply| Command::RemoveGroup { group_id, reply })
            .await
    }

    pub async fn update_group(&self, group_id: i32, metadata: Vec<u8>) -> Result<(), ServerError> {
        self.request(|reply| Command::UpdateGroup {
            group_id,
            metadata,
            reply,
        })
        .await
    }

    pub async fn update_user(
        &self,
        group_id: i32,
        user_id: i32,
        metadata: Vec<u8>,
    ) -> Result<(), ServerError> {
        self.request(|reply| Command::UpdateUser {
            group_id,
            user_id,
            metadata,
            reply,
        })
        .await
    }

    /// Send a notification to one client (`Some`) or all of them
    pub fn notify(&self, client_id: Option<ClientId>, data: Vec<u8>) -> Result<(), ServerError> {
        self.commands
            .send(Command::Notify { client_id, data })
            .map_err(|_| ServerError::Stopped)
    }

    pub async fn stats(&self) -> Result<ServerStats, ServerError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn poll_events(&self, f: impl FnMut(Event)) -> usize {
        self.events.poll(f)
    }

    /// Make [`Server::run`] return
    pub fn stop(&self) {
        self.tcp_stop.stop();
        self.udp.stop();
    }
}

enum Step {
    Tcp(Result<Option<TcpEvent>, NetworkError>),
    Command(Command),
}

/// The control server: TCP for sessions, UDP for queries and relaying
pub struct Server {
    tcp: TcpServer,
    udp: Arc<UdpServer>,
    state: ServerState,
    decoders: HashMap<ClientId, FrameDecoder>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: ServerHandle,
    to_close: Vec<ClientId>,
    out: Vec<u8>,
}

impl Server {
    /// Bind TCP and UDP sockets on the configured port
    pub async fn bind(config: ServerConfig, events: EventMode) -> Result<Self, ServerError> {
        let config = config.validated();
        let mut next_id: ClientId = 0;
        let tcp = TcpServer::bind(config.port, config.family, move |_| {
            next_id += 1;
            Some(next_id)
        })
        .await
        .map_err(ServerError::Bind)?;
        let udp = UdpServer::bind(UdpServerConfig {
            port: tcp.local_addr().port(),
            family: config.family,
            ..Default::default()
        })
        .await
        .map_err(ServerError::Bind)?;
        let udp = Arc::new(udp);

        let events = Arc::new(EventQueue::new(events));
        let (tx, commands) = mpsc::unbounded_channel();
        let handle = ServerHandle {
            commands: tx,
            tcp_stop: tcp.stop_handle(),
            udp: udp.clone(),
            events: events.clone(),
        };
        info!(
            "Server listening on port {} (relay {}, auto-create {}, persistent groups {})",
            tcp.local_addr().port(),
            config.server_relay,
            config.group_auto_create,
            config.persistent_groups
        );
        Ok(Self {
            tcp,
            udp,
            state: ServerState::new(config, events),
            decoders: HashMap::new(),
            commands,
            handle,
            to_close: Vec::new(),
            out: Vec::new(),
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Serve until [`ServerHandle::stop`] is called or the listening socket
    /// fails
    pub async fn run(mut self) -> Result<(), ServerError> {
        let udp = self.udp.clone();
        let relay = self.state.config().server_relay;
        let out = Mutex::new(Vec::new());
        let sender = udp.clone();
        let udp_task = tokio::spawn(async move {
            let handler = Arc::new(move |received: Received<'_>| match received {
                Received::Packet { data, from } => {
                    if let Err(e) = handle_datagram(&sender, relay, data, from, &mut out.lock()) {
                        debug!("Datagram from {}: {}", from, e);
                    }
                }
                Received::Error(e) => trace!("UDP receive error: {}", e),
            });
            udp.run(handler).await
        });

        let result = self.serve().await;
        self.udp.stop();
        match udp_task.await {
            Ok(Err(e)) => warn!("UDP server failed: {}", e),
            Err(e) => warn!("UDP task failed: {}", e),
            Ok(Ok(())) => {}
        }
        info!("Server stopped");
        result
    }

    async fn serve(&mut self) -> Result<(), ServerError> {
        loop {
            let step = tokio::select! {
                event = self.tcp.next_event() => Step::Tcp(event),
                Some(command) = self.commands.recv() => Step::Command(command),
            };
            match step {
                Step::Tcp(Ok(Some(event))) => self.on_tcp_event(event),
                Step::Tcp(Ok(None)) => return Ok(()),
                Step::Tcp(Err(e)) => return Err(e.into()),
                Step::Command(command) => self.on_command(command),
            }
            self.flush().await;
        }
    }

    fn on_tcp_event(&mut self, event: TcpEvent) {
        match event {
            TcpEvent::Accepted { id, addr } => {
                self.state.add_client(id, addr);
                self.decoders.insert(id, FrameDecoder::new());
            }
            TcpEvent::Data { id, data } => {
                let Some(decoder) = self.decoders.get_mut(&id) else {
                    return;
                };
                decoder.push(&data);
                let mut frames = Vec::new();
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => frames.push(frame),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Closing client {}: {}", id, e);
                            self.to_close.push(id);
                            break;
                        }
                    }
                }
                for frame in frames {
                    if let Err(e) = self.handle_frame(id, &frame) {
                        warn!("Bad message from client {}: {}", id, e);
                    }
                }
            }
            TcpEvent::Closed { id, error } => {
                match error {
                    Some(e) => info!("Client {} connection lost: {}", id, e),
                    None => info!("Client {} disconnected", id),
                }
                self.decoders.remove(&id);
                self.state.remove_client(id);
            }
        }
    }

    fn handle_frame(&mut self, id: ClientId, frame: &[u8]) -> Result<(), NetworkError> {
        let msg = OscMessage::decode(frame)?;
        let (target, cmd_name) = parse_control_address(&msg)?;
        if target != Target::Server {
            return Err(NetworkError::UnknownAddress(msg.address.clone()));
        }
        let request = ClientRequest::decode(cmd_name, &msg)?;
        trace!("Client {}: {}", id, cmd_name);
        self.state.handle_request(id, request);
        Ok(())
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AddGroup {
                name,
                password,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.state.add_group(&name, &password, metadata));
            }
            Command::RemoveGroup { group_id, reply } => {
                let _ = reply.send(self.state.remove_group(group_id));
            }
            Command::UpdateGroup {
                group_id,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.state.update_group(group_id, metadata));
            }
            Command::UpdateUser {
                group_id,
                user_id,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.state.update_user(group_id, user_id, metadata));
            }
            Command::Notify { client_id, data } => self.state.notify(client_id, data),
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.state.stats()));
            }
        }
    }

    /// Deliver queued messages and close failed connections. Closing a
    /// client produces leave notifications, so repeat until both are empty.
    async fn flush(&mut self) {
        loop {
            let outbox = self.state.take_outbox();
            if outbox.is_empty() && self.to_close.is_empty() {
                return;
            }
            for (id, message) in outbox {
                if self.to_close.contains(&id) {
                    continue;
                }
                self.out.clear();
                if let Err(e) = write_frame(&mut self.out, &message.to_osc().to_bytes()) {
                    warn!("Message for client {} dropped: {}", id, e);
                    continue;
                }
                if let Err(e) = self.tcp.send(id, &self.out).await {
                    warn!("Sending to client {} failed: {}", id, e);
                    self.to_close.push(id);
                }
            }
            for id in std::mem::take(&mut self.to_close) {
                self.tcp.close(id).await;
                self.decoders.remove(&id);
                self.state.remove_client(id);
            }
        }
    }
}

/// Answer an address query or forward a relay packet
fn handle_datagram(
    udp: &UdpServer,
    relay: bool,
    data: &[u8],
    from: SocketAddr,
    out: &mut Vec<u8>,
) -> Result<(), NetworkError> {
    if data.is_empty() {
        return Ok(());
    }
    let from = IpAddress::new(from).unmapped();
    let r = route(data)?;
    match r.target {
        Target::Server if r.cmd == cmd::QUERY => {
            out.clear();
            query_reply(&from.ip().to_string(), from.port()).encode(out);
            udp.try_send_to(out, from)?;
            trace!("Answered address query from {}", from);
        }
        Target::Client if r.cmd.is_empty() => {
            if !relay {
                trace!("Relay disabled, dropping packet from {}", from);
                return Ok(());
            }
            let (destination, payload) = binary::parse_relay(data)?;
            out.clear();
            binary::write_relay(out, from, payload);
            udp.try_send_to(out, destination)?;
        }
        _ => trace!("Ignoring datagram from {}", from),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::version_string;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn state(config: ServerConfig) -> ServerState {
        ServerState::new(config, Arc::new(EventQueue::new(EventMode::default())))
    }

    fn login(state: &mut ServerState, id: ClientId) {
        state.add_client(id, addr(5000 + id as u16));
        state.handle_request(
            id,
            ClientRequest::Login {
                token: 1,
                version: version_string(),
                password: String::new(),
                metadata: None,
            },
        );
    }

    fn join(state: &mut ServerState, id: ClientId, group: &str, user: &str) {
        state.handle_request(
            id,
            ClientRequest::GroupJoin {
                token: 2,
                group_name: group.to_string(),
                group_password: String::new(),
                user_name: user.to_string(),
                user_password: String::new(),
                group_metadata: None,
                user_metadata: None,
                addresses: vec![addr(6000 + id as u16)],
            },
        );
    }

    fn count<F: Fn(&ServerMessage) -> bool>(out: &[(ClientId, ServerMessage)], to: ClientId, f: F) -> usize {
        out.iter().filter(|(id, m)| *id == to && f(m)).count()
    }

    #[test]
    fn test_login_checks_password_and_version() {
        let mut s = state(ServerConfig {
            password: Some("secret".to_string()),
            ..Default::default()
        });
        s.add_client(1, addr(5001));
        s.handle_request(
            1,
            ClientRequest::Login {
                token: 7,
                version: version_string(),
                password: "wrong".to_string(),
                metadata: None,
            },
        );
        s.handle_request(
            1,
            ClientRequest::Login {
                token: 8,
                version: "jamlink 99.0".to_string(),
                password: "secret".to_string(),
                metadata: None,
            },
        );
        let out = s.take_outbox();
        assert!(matches!(
            &out[0].1,
            ServerMessage::Login { token: 7, result: Err(e) } if e.code == ErrorCode::WrongPassword
        ));
        assert!(matches!(
            &out[1].1,
            ServerMessage::Login { token: 8, result: Err(e) } if e.code == ErrorCode::VersionMismatch
        ));
    }

    #[test]
    fn test_join_requires_login() {
        let mut s = state(ServerConfig::default());
        s.add_client(1, addr(5001));
        join(&mut s, 1, "band", "alice");
        let out = s.take_outbox();
        assert!(matches!(
            &out[0].1,
            ServerMessage::GroupJoin { result: Err(e), .. } if e.code == ErrorCode::NotLoggedIn
        ));
    }

    #[test]
    fn test_members_are_introduced_once() {
        let mut s = state(ServerConfig::default());
        login(&mut s, 1);
        login(&mut s, 2);
        s.take_outbox();

        join(&mut s, 1, "band", "alice");
        join(&mut s, 2, "band", "bob");
        let out = s.take_outbox();

        let peer_join = |m: &ServerMessage| matches!(m, ServerMessage::PeerJoin(_));
        assert_eq!(count(&out, 1, peer_join), 1);
        assert_eq!(count(&out, 2, peer_join), 1);
        let Some((_, ServerMessage::PeerJoin(bob))) = out.iter().find(|(id, m)| *id == 1 && peer_join(m)) else {
            panic!("alice was not told about bob");
        };
        assert_eq!(bob.user_name, "bob");
        assert_eq!(bob.addresses, vec![addr(6002)]);
        // The reply comes before the announcements
        assert!(matches!(
            out.iter().find(|(id, _)| *id == 2).map(|(_, m)| m),
            Some(ServerMessage::GroupJoin { result: Ok(_), .. })
        ));
        assert_eq!(s.stats().members, 2);
    }

    #[test]
    fn test_disconnect_cleans_up() {
        let mut s = state(ServerConfig::default());
        login(&mut s, 1);
        login(&mut s, 2);
        join(&mut s, 1, "band", "alice");
        join(&mut s, 2, "band", "bob");
        s.take_outbox();

        s.remove_client(1);
        let out = s.take_outbox();
        let leaves = count(&out, 2, |m| {
            matches!(m, ServerMessage::PeerLeave { user_id: 0, .. })
        });
        assert_eq!(leaves, 1);

        s.remove_client(2);
        assert_eq!(s.stats(), ServerStats::default());
        let mut removed = 0;
        s.events.poll(|e| {
            if matches!(e, Event::GroupRemove(_)) {
                removed += 1;
            }
        });
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_persistent_group_keeps_user_names() {
        let mut s = state(ServerConfig {
            persistent_groups: true,
            ..Default::default()
        });
        login(&mut s, 1);
        join(&mut s, 1, "band", "alice");
        s.remove_client(1);
        assert_eq!(s.stats().groups, 1);

        // Same user name comes back and gets the same id
        login(&mut s, 2);
        s.take_outbox();
        join(&mut s, 2, "band", "alice");
        let out = s.take_outbox();
        assert!(matches!(
            &out[0].1,
            ServerMessage::GroupJoin { result: Ok(r), .. } if r.user_id == 0
        ));
    }

    #[test]
    fn test_join_errors() {
        let mut s = state(ServerConfig {
            group_auto_create: false,
            ..Default::default()
        });
        login(&mut s, 1);
        login(&mut s, 2);
        join(&mut s, 1, "missing", "alice");
        s.add_group("band", "", None).unwrap();
        join(&mut s, 1, "band", "alice");
        join(&mut s, 1, "band", "alice2");
        join(&mut s, 2, "band", "alice");
        let codes: Vec<_> = s
            .take_outbox()
            .into_iter()
            .filter_map(|(_, m)| match m {
                ServerMessage::GroupJoin { result, .. } => Some(result.err().map(|e| e.code)),
                _ => None,
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                Some(ErrorCode::GroupNotFound),
                None,
                Some(ErrorCode::AlreadyMember),
                Some(ErrorCode::UserAlreadyExists),
            ]
        );
        assert!(matches!(
            s.add_group("band", "", None),
            Err(ServerError::GroupExists(_))
        ));
    }

    #[test]
    fn test_leave_and_not_member() {
        let mut s = state(ServerConfig::default());
        login(&mut s, 1);
        join(&mut s, 1, "band", "alice");
        let group_id = s.group_id("band").unwrap();
        s.take_outbox();
        s.handle_request(1, ClientRequest::GroupLeave { token: 3, group_id });
        s.handle_request(1, ClientRequest::GroupLeave { token: 4, group_id });
        let out = s.take_outbox();
        assert!(matches!(&out[0].1, ServerMessage::GroupLeave { token: 3, result: Ok(()) }));
        assert!(matches!(
            &out[1].1,
            ServerMessage::GroupLeave { token: 4, result: Err(e) } if e.code == ErrorCode::NotMember
        ));
    }

    #[test]
    fn test_messages_and_metadata() {
        let mut s = state(ServerConfig::default());
        for id in 1..=3 {
            login(&mut s, id);
        }
        join(&mut s, 1, "band", "alice");
        join(&mut s, 2, "band", "bob");
        join(&mut s, 3, "band", "carol");
        let group_id = s.group_id("band").unwrap();
        s.take_outbox();

        s.handle_request(
            1,
            ClientRequest::Message {
                group_id,
                target: -1,
                flags: 0,
                data: b"hi".to_vec(),
            },
        );
        s.handle_request(
            1,
            ClientRequest::Message {
                group_id,
                target: 2,
                flags: 0,
                data: b"carol only".to_vec(),
            },
        );
        let out = s.take_outbox();
        let msg = |m: &ServerMessage| matches!(m, ServerMessage::Message { user_id: 0, .. });
        assert_eq!(count(&out, 1, msg), 0);
        assert_eq!(count(&out, 2, msg), 1);
        assert_eq!(count(&out, 3, msg), 2);

        s.handle_request(
            2,
            ClientRequest::UserUpdate {
                token: 9,
                group_id,
                metadata: vec![1],
            },
        );
        let out = s.take_outbox();
        let update = |m: &ServerMessage| matches!(m, ServerMessage::PeerUpdate { user_id: 1, .. });
        assert_eq!(count(&out, 1, update), 1);
        assert_eq!(count(&out, 3, update), 1);
        assert_eq!(count(&out, 2, update), 0);

        s.update_group(group_id, vec![2]).unwrap();
        let out = s.take_outbox();
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .all(|(_, m)| matches!(m, ServerMessage::GroupChanged { user_id: -1, .. })));
    }

    #[test]
    fn test_remove_group_ejects_members() {
        let mut s = state(ServerConfig::default());
        login(&mut s, 1);
        join(&mut s, 1, "band", "alice");
        let group_id = s.group_id("band").unwrap();
        s.take_outbox();
        s.remove_group(group_id).unwrap();
        let out = s.take_outbox();
        assert!(matches!(&out[..], [(1, ServerMessage::GroupEject { .. })]));
        // Leaving afterwards is an error, not a crash
        s.handle_request(1, ClientRequest::GroupLeave { token: 1, group_id });
        assert!(matches!(
            &s.take_outbox()[0].1,
            ServerMessage::GroupLeave { result: Err(_), .. }
        ));
    }
}
