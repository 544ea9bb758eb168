use std::collections::BTreeMap;
use std::time::Duration;

use mrpc::{Context, Error, ErrorKind, Reply, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetByIdReq {
    pub id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserReply {
    pub user: User,
    /// the instance that answered.
    pub served_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportReq {
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportResp {
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepReq {
    pub millis: u64,
}

#[mrpc::service(name = "user-service")]
pub trait UserService {
    async fn get_by_id(&self, ctx: Context, req: GetByIdReq) -> Result<UserReply>;

    /// Exports users in order and stops at the first unknown id; the users
    /// exported so far travel with the error.
    async fn export(&self, ctx: Context, req: ExportReq) -> Reply<ExportResp>;

    async fn sleep(&self, ctx: Context, req: SleepReq) -> Result<SleepReq>;
}

/// An in-memory user table answering as one named instance.
pub struct UserStore {
    instance: String,
    users: BTreeMap<u64, User>,
    broken: bool,
}

impl UserStore {
    pub fn new(instance: &str) -> UserStore {
        let users = [(1, "alice"), (2, "bob"), (3, "carol")]
            .into_iter()
            .map(|(id, name)| {
                (
                    id,
                    User {
                        id,
                        name: name.to_owned(),
                    },
                )
            })
            .collect();
        UserStore {
            instance: instance.to_owned(),
            users,
            broken: false,
        }
    }

    /// Every lookup fails, as if the backing store were gone.
    pub fn broken(mut self) -> UserStore {
        self.broken = true;
        self
    }
}

#[mrpc::async_trait]
impl UserService for UserStore {
    async fn get_by_id(&self, _ctx: Context, req: GetByIdReq) -> Result<UserReply> {
        if self.broken {
            return Err(Error::new(
                ErrorKind::Other,
                format!("{}: user table unavailable", self.instance),
            ));
        }
        match self.users.get(&req.id) {
            Some(user) => Ok(UserReply {
                user: user.clone(),
                served_by: self.instance.clone(),
            }),
            None => Err(Error::new(ErrorKind::Other, format!("no user {}", req.id))),
        }
    }

    async fn export(&self, _ctx: Context, req: ExportReq) -> Reply<ExportResp> {
        let mut resp = ExportResp::default();
        for id in req.ids {
            match self.users.get(&id) {
                Some(user) => resp.users.push(user.clone()),
                None => return Reply::partial(resp, Error::new(ErrorKind::Other, format!("no user {}", id))),
            }
        }
        Reply::ok(resp)
    }

    async fn sleep(&self, _ctx: Context, req: SleepReq) -> Result<SleepReq> {
        tokio::time::sleep(Duration::from_millis(req.millis)).await;
        Ok(req)
    }
}
