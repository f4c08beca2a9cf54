//! Control messages between clients and the server
//!
//! These travel over the TCP control connection, one OSC message per
//! length-prefixed frame. Requests carry a client-chosen token that the
//! server echoes in its reply so the client can match them up.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::network::NetworkError;

use super::messages::{address, Target};
use super::osc::{ArgReader, OscMessage};

/// Request and notification names
pub mod cmd {
    pub const LOGIN: &str = "login";
    pub const GROUP_JOIN: &str = "group_join";
    pub const GROUP_LEAVE: &str = "group_leave";
    pub const GROUP_UPDATE: &str = "group_update";
    pub const USER_UPDATE: &str = "user_update";
    pub const MESSAGE: &str = "msg";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const PEER_JOIN: &str = "peer_join";
    pub const PEER_LEAVE: &str = "peer_leave";
    pub const PEER_UPDATE: &str = "peer_update";
    pub const GROUP_CHANGED: &str = "group_changed";
    pub const USER_CHANGED: &str = "user_changed";
    pub const GROUP_EJECT: &str = "group_eject";
    pub const NOTIFY: &str = "notify";
}

/// Error codes carried in failed replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 1,
    VersionMismatch = 2,
    WrongPassword = 3,
    NotLoggedIn = 4,
    AlreadyLoggedIn = 5,
    GroupNotFound = 6,
    UserAlreadyExists = 7,
    AlreadyMember = 8,
    NotMember = 9,
    UserNotFound = 10,
}

impl ErrorCode {
    pub fn from_i32(value: i32) -> Self {
        match value {
            2 => ErrorCode::VersionMismatch,
            3 => ErrorCode::WrongPassword,
            4 => ErrorCode::NotLoggedIn,
            5 => ErrorCode::AlreadyLoggedIn,
            6 => ErrorCode::GroupNotFound,
            7 => ErrorCode::UserAlreadyExists,
            8 => ErrorCode::AlreadyMember,
            9 => ErrorCode::NotMember,
            10 => ErrorCode::UserNotFound,
            _ => ErrorCode::Unspecified,
        }
    }
}

/// Failed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReply {
    pub client_id: i32,
    /// Whether the server forwards traffic between peers that cannot reach each other
    pub relay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupJoinReply {
    pub group_id: i32,
    pub user_id: i32,
    pub group_metadata: Option<Vec<u8>>,
}

/// Another member of a group, as announced by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub group_id: i32,
    pub group_name: String,
    pub user_id: i32,
    pub user_name: String,
    pub metadata: Option<Vec<u8>>,
    /// Candidate addresses, local interfaces first, public address last
    pub addresses: Vec<SocketAddr>,
}

/// Requests from a client to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Login {
        token: i32,
        version: String,
        password: String,
        metadata: Option<Vec<u8>>,
    },
    GroupJoin {
        token: i32,
        group_name: String,
        group_password: String,
        user_name: String,
        user_password: String,
        group_metadata: Option<Vec<u8>>,
        user_metadata: Option<Vec<u8>>,
        addresses: Vec<SocketAddr>,
    },
    GroupLeave {
        token: i32,
        group_id: i32,
    },
    GroupUpdate {
        token: i32,
        group_id: i32,
        metadata: Vec<u8>,
    },
    UserUpdate {
        token: i32,
        group_id: i32,
        metadata: Vec<u8>,
    },
    /// Message for one member (`target >= 0`) or the whole group (`target == -1`)
    Message {
        group_id: i32,
        target: i32,
        flags: i32,
        data: Vec<u8>,
    },
    Ping {
        token: i32,
    },
}

fn push_addresses(msg: &mut OscMessage, addresses: &[SocketAddr]) {
    for addr in addresses {
        msg.push(addr.ip().to_string());
        msg.push(i32::from(addr.port()));
    }
}

fn read_addresses(r: &mut ArgReader<'_>) -> Result<Vec<SocketAddr>, NetworkError> {
    if r.remaining() % 2 != 0 {
        return Err(NetworkError::malformed("odd number of address arguments"));
    }
    let mut addresses = Vec::with_capacity(r.remaining() / 2);
    while r.remaining() > 0 {
        let ip: IpAddr = r.string()?.parse()?;
        let port = u16::try_from(r.int()?)
            .map_err(|_| NetworkError::malformed("port out of range"))?;
        addresses.push(SocketAddr::new(ip, port));
    }
    Ok(addresses)
}

fn opt_blob(r: &mut ArgReader<'_>) -> Result<Option<Vec<u8>>, NetworkError> {
    Ok(r.opt_blob()?.map(<[u8]>::to_vec))
}

impl ClientRequest {
    pub fn to_osc(&self) -> OscMessage {
        let server = |c: &str| OscMessage::new(address(Target::Server, c));
        match self {
            ClientRequest::Login {
                token,
                version,
                password,
                metadata,
            } => server(cmd::LOGIN)
                .with(*token)
                .with(version.as_str())
                .with(password.as_str())
                .with(metadata.clone()),
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
                let mut msg = server(cmd::GROUP_JOIN)
                    .with(*token)
                    .with(group_name.as_str())
                    .with(group_password.as_str())
                    .with(user_name.as_str())
                    .with(user_password.as_str())
                    .with(group_metadata.clone())
                    .with(user_metadata.clone());
                push_addresses(&mut msg, addresses);
                msg
            }
            ClientRequest::GroupLeave { token, group_id } => {
                server(cmd::GROUP_LEAVE).with(*token).with(*group_id)
            }
            ClientRequest::GroupUpdate {
                token,
                group_id,
                metadata,
            } => server(cmd::GROUP_UPDATE)
                .with(*token)
                .with(*group_id)
                .with(metadata.clone()),
            ClientRequest::UserUpdate {
                token,
                group_id,
                metadata,
            } => server(cmd::USER_UPDATE)
                .with(*token)
                .with(*group_id)
                .with(metadata.clone()),
            ClientRequest::Message {
                group_id,
                target,
                flags,
                data,
            } => server(cmd::MESSAGE)
                .with(*group_id)
                .with(*target)
                .with(*flags)
                .with(data.clone()),
            ClientRequest::Ping { token } => server(cmd::PING).with(*token),
        }
    }

    pub fn decode(cmd_name: &str, msg: &OscMessage) -> Result<Self, NetworkError> {
        let mut r = msg.reader();
        let request = match cmd_name {
            cmd::LOGIN => ClientRequest::Login {
                token: r.int()?,
                version: r.string()?.to_string(),
                password: r.string()?.to_string(),
                metadata: opt_blob(&mut r)?,
            },
            cmd::GROUP_JOIN => ClientRequest::GroupJoin {
                token: r.int()?,
                group_name: r.string()?.to_string(),
                group_password: r.string()?.to_string(),
                user_name: r.string()?.to_string(),
                user_password: r.string()?.to_string(),
                group_metadata: opt_blob(&mut r)?,
                user_metadata: opt_blob(&mut r)?,
                addresses: read_addresses(&mut r)?,
            },
            cmd::GROUP_LEAVE => ClientRequest::GroupLeave {
                token: r.int()?,
                group_id: r.int()?,
            },
            cmd::GROUP_UPDATE => ClientRequest::GroupUpdate {
                token: r.int()?,
                group_id: r.int()?,
                metadata: r.blob()?.to_vec(),
            },
            cmd::USER_UPDATE => ClientRequest::UserUpdate {
                token: r.int()?,
                group_id: r.int()?,
                metadata: r.blob()?.to_vec(),
            },
            cmd::MESSAGE => ClientRequest::Message {
                group_id: r.int()?,
                target: r.int()?,
                flags: r.int()?,
                data: r.blob()?.to_vec(),
            },
            cmd::PING => ClientRequest::Ping { token: r.int()? },
            other => return Err(NetworkError::UnknownAddress(other.to_string())),
        };
        Ok(request)
    }
}

/// Replies and notifications from the server to a client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Login {
        token: i32,
        result: Result<LoginReply, ErrorReply>,
    },
    GroupJoin {
        token: i32,
        result: Result<GroupJoinReply, ErrorReply>,
    },
    GroupLeave {
        token: i32,
        result: Result<(), ErrorReply>,
    },
    GroupUpdate {
        token: i32,
        result: Result<(), ErrorReply>,
    },
    UserUpdate {
        token: i32,
        result: Result<(), ErrorReply>,
    },
    Pong {
        token: i32,
    },
    PeerJoin(PeerAnnouncement),
    PeerLeave {
        group_id: i32,
        user_id: i32,
    },
    PeerUpdate {
        group_id: i32,
        user_id: i32,
        metadata: Vec<u8>,
    },
    /// Group metadata changed; `user_id` is -1 when the server changed it
    GroupChanged {
        group_id: i32,
        user_id: i32,
        metadata: Vec<u8>,
    },
    /// The server changed this client's own user metadata
    UserChanged {
        group_id: i32,
        user_id: i32,
        metadata: Vec<u8>,
    },
    GroupEject {
        group_id: i32,
    },
    Message {
        group_id: i32,
        user_id: i32,
        flags: i32,
        data: Vec<u8>,
    },
    Notification {
        data: Vec<u8>,
    },
}

fn reply(c: &str, token: i32, error: Option<&ErrorReply>) -> OscMessage {
    let msg = OscMessage::new(address(Target::Client, c)).with(token);
    match error {
        Some(e) => msg.with(e.code as i32).with(e.message.as_str()),
        None => msg.with(0i32).with(""),
    }
}

fn read_result(r: &mut ArgReader<'_>) -> Result<Option<ErrorReply>, NetworkError> {
    let code = r.int()?;
    let message = r.string()?;
    if code == 0 {
        Ok(None)
    } else {
        Ok(Some(ErrorReply::new(ErrorCode::from_i32(code), message)))
    }
}

fn read_unit_result(r: &mut ArgReader<'_>) -> Result<Result<(), ErrorReply>, NetworkError> {
    Ok(match read_result(r)? {
        Some(e) => Err(e),
        None => Ok(()),
    })
}

impl ServerMessage {
    pub fn to_osc(&self) -> OscMessage {
        let client = |c: &str| OscMessage::new(address(Target::Client, c));
        match self {
            ServerMessage::Login { token, result } => match result {
                Ok(login) => reply(cmd::LOGIN, *token, None)
                    .with(login.client_id)
                    .with(login.relay),
                Err(e) => reply(cmd::LOGIN, *token, Some(e)),
            },
            ServerMessage::GroupJoin { token, result } => match result {
                Ok(join) => reply(cmd::GROUP_JOIN, *token, None)
                    .with(join.group_id)
                    .with(join.user_id)
                    .with(join.group_metadata.clone()),
                Err(e) => reply(cmd::GROUP_JOIN, *token, Some(e)),
            },
            ServerMessage::GroupLeave { token, result } => {
                reply(cmd::GROUP_LEAVE, *token, result.as_ref().err())
            }
            ServerMessage::GroupUpdate { token, result } => {
                reply(cmd::GROUP_UPDATE, *token, result.as_ref().err())
            }
            ServerMessage::UserUpdate { token, result } => {
                reply(cmd::USER_UPDATE, *token, result.as_ref().err())
            }
            ServerMessage::Pong { token } => client(cmd::PONG).with(*token),
            ServerMessage::PeerJoin(peer) => {
                let mut msg = client(cmd::PEER_JOIN)
                    .with(peer.group_id)
                    .with(peer.group_name.as_str())
                    .with(peer.user_id)
                    .with(peer.user_name.as_str())
                    .with(peer.metadata.clone());
                push_addresses(&mut msg, &peer.addresses);
                msg
            }
            ServerMessage::PeerLeave { group_id, user_id } => {
                client(cmd::PEER_LEAVE).with(*group_id).with(*user_id)
            }
            ServerMessage::PeerUpdate {
                group_id,
                user_id,
                metadata,
            } => client(cmd::PEER_UPDATE)
                .with(*group_id)
                .with(*user_id)
                .with(metadata.clone()),
            ServerMessage::GroupChanged {
                group_id,
                user_id,
                metadata,
            } => client(cmd::GROUP_CHANGED)
                .with(*group_id)
                .with(*user_id)
                .with(metadata.clone()),
            ServerMessage::UserChanged {
                group_id,
                user_id,
                metadata,
            } => client(cmd::USER_CHANGED)
                .with(*group_id)
                .with(*user_id)
                .with(metadata.clone()),
            ServerMessage::GroupEject { group_id } => client(cmd::GROUP_EJECT).with(*group_id),
            ServerMessage::Message {
                group_id,
                user_id,
                flags,
                data,
            } => client(cmd::MESSAGE)
                .with(*group_id)
                .with(*user_id)
                .with(*flags)
                .with(data.clone()),
            ServerMessage::Notification { data } => client(cmd::NOTIFY).with(data.clone()),
        }
    }

    pub fn decode(cmd_name: &str, msg: &OscMessage) -> Result<Self, NetworkError> {
        let mut r = msg.reader();
        let message = match cmd_name {
            cmd::LOGIN => {
                let token = r.int()?;
                let result = match read_result(&mut r)? {
                    Some(e) => Err(e),
                    None => Ok(LoginReply {
                        client_id: r.int()?,
                        relay: r.bool()?,
                    }),
                };
                ServerMessage::Login { token, result }
            }
            cmd::GROUP_JOIN => {
                let token = r.int()?;
                let result = match read_result(&mut r)? {
                    Some(e) => Err(e),
                    None => Ok(GroupJoinReply {
                        group_id: r.int()?,
                        user_id: r.int()?,
                        group_metadata: opt_blob(&mut r)?,
                    }),
                };
                ServerMessage::GroupJoin { token, result }
            }
            cmd::GROUP_LEAVE => ServerMessage::GroupLeave {
                token: r.int()?,
                result: read_unit_result(&mut r)?,
            },
            cmd::GROUP_UPDATE => ServerMessage::GroupUpdate {
                token: r.int()?,
                result: read_unit_result(&mut r)?,
            },
            cmd::USER_UPDATE => ServerMessage::UserUpdate {
                token: r.int()?,
                result: read_unit_result(&mut r)?,
            },
            cmd::PONG => ServerMessage::Pong { token: r.int()? },
            cmd::PEER_JOIN => ServerMessage::PeerJoin(PeerAnnouncement {
                group_id: r.int()?,
                group_name: r.string()?.to_string(),
                user_id: r.int()?,
                user_name: r.string()?.to_string(),
                metadata: opt_blob(&mut r)?,
                addresses: read_addresses(&mut r)?,
            }),
            cmd::PEER_LEAVE => ServerMessage::PeerLeave {
                group_id: r.int()?,
                user_id: r.int()?,
            },
            cmd::PEER_UPDATE => ServerMessage::PeerUpdate {
                group_id: r.int()?,
                user_id: r.int()?,
                metadata: r.blob()?.to_vec(),
            },
            cmd::GROUP_CHANGED => ServerMessage::GroupChanged {
                group_id: r.int()?,
                user_id: r.int()?,
                metadata: r.blob()?.to_vec(),
            },
            cmd::USER_CHANGED => ServerMessage::UserChanged {
                group_id: r.int()?,
                user_id: r.int()?,
                metadata: r.blob()?.to_vec(),
            },
            cmd::GROUP_EJECT => ServerMessage::GroupEject {
                group_id: r.int()?,
            },
            cmd::MESSAGE => ServerMessage::Message {
                group_id: r.int()?,
                user_id: r.int()?,
                flags: r.int()?,
                data: r.blob()?.to_vec(),
            },
            cmd::NOTIFY => ServerMessage::Notification {
                data: r.blob()?.to_vec(),
            },
            other => return Err(NetworkError::UnknownAddress(other.to_string())),
        };
        Ok(message)
    }
}

/// Split a control address into its target and command
pub fn parse_control_address(msg: &OscMessage) -> Result<(Target, &str), NetworkError> {
    let server_prefix = address(Target::Server, "");
    let client_prefix = address(Target::Client, "");
    if let Some(c) = msg.address.strip_prefix(&server_prefix) {
        Ok((Target::Server, c))
    } else if let Some(c) = msg.address.strip_prefix(&client_prefix) {
        Ok((Target::Client, c))
    } else {
        Err(NetworkError::UnknownAddress(msg.address.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: ClientRequest) {
        let osc = OscMessage::decode(&req.to_osc().to_bytes()).unwrap();
        let (target, c) = parse_control_address(&osc).unwrap();
        assert_eq!(target, Target::Server);
        assert_eq!(ClientRequest::decode(c, &osc).unwrap(), req);
    }

    fn roundtrip_reply(msg: ServerMessage) {
        let osc = OscMessage::decode(&msg.to_osc().to_bytes()).unwrap();
        let (target, c) = parse_control_address(&osc).unwrap();
        assert_eq!(target, Target::Client);
        assert_eq!(ServerMessage::decode(c, &osc).unwrap(), msg);
    }

    #[test]
    fn test_group_join_request_with_addresses() {
        roundtrip_request(ClientRequest::GroupJoin {
            token: 3,
            group_name: "band".into(),
            group_password: "".into(),
            user_name: "alice".into(),
            user_password: "pw".into(),
            group_metadata: None,
            user_metadata: Some(vec![1]),
            addresses: vec![
                "192.168.1.2:4000".parse().unwrap(),
                "[2001:db8::5]:4000".parse().unwrap(),
            ],
        });
    }

    #[test]
    fn test_error_reply() {
        roundtrip_reply(ServerMessage::GroupJoin {
            token: 9,
            result: Err(ErrorReply::new(ErrorCode::WrongPassword, "wrong group password")),
        });
        roundtrip_reply(ServerMessage::GroupLeave {
            token: 2,
            result: Err(ErrorReply::new(ErrorCode::NotMember, "")),
        });
    }

    #[test]
    fn test_success_replies() {
        roundtrip_reply(ServerMessage::Login {
            token: 1,
            result: Ok(LoginReply {
                client_id: 12,
                relay: true,
            }),
        });
        roundtrip_reply(ServerMessage::UserUpdate {
            token: 4,
            result: Ok(()),
        });
    }

    #[test]
    fn test_peer_join_announcement() {
        roundtrip_reply(ServerMessage::PeerJoin(PeerAnnouncement {
            group_id: 1,
            group_name: "band".into(),
            user_id: 2,
            user_name: "bob".into(),
            metadata: None,
            addresses: vec!["10.0.0.3:5000".parse().unwrap()],
        }));
    }

    #[test]
    fn test_unknown_error_code_maps_to_unspecified() {
        assert_eq!(ErrorCode::from_i32(999), ErrorCode::Unspecified);
        assert_eq!(ErrorCode::from_i32(6), ErrorCode::GroupNotFound);
    }
}
