//! In-process owners store.
//!
//! This provides a [`Remote`] backed by a `BTreeMap`, used for dry runs (`memory://`) and to drive
//! the engine in tests without a network. It mimics the validation of the real API: letters-only
//! names, numeric telephones and unique telephones (`409 Conflict`). The remote is [`Clone`] so
//! tests can hold a handle for direct inspection while the run owns a shared copy.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;

use super::{Endpoint, Method, RawResponse, Remote, RemoteResult, Request};
use crate::entity::Owner;

/// Maximum number of owners returned by `GET /owners`.
const LIST_PAGE_SIZE: usize = 100;

#[derive(Debug, Default)]
struct Store {
    next_id: u64,
    owners: BTreeMap<u64, Owner>,
    telephones: HashMap<String, u64>,
    /// Statuses to answer with before handling requests normally.
    scripted: VecDeque<u16>,
    requests: HashMap<Endpoint, u64>,
}

#[derive(Serialize)]
struct StoredOwner<'a> {
    id: u64,
    #[serde(flatten)]
    owner: &'a Owner,
}

/// A [`Remote`] answering from an in-process owners store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemote {
    store: Arc<Mutex<Store>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers the next `times` attempts with `status`, regardless of the request.
    pub fn fail_next(&self, status: u16, times: usize) {
        let mut store = self.store.lock().unwrap();
        store.scripted.extend(std::iter::repeat_n(status, times));
    }

    /// Number of attempts received for `endpoint`, including scripted failures.
    pub fn requests_to(&self, endpoint: Endpoint) -> u64 {
        let store = self.store.lock().unwrap();
        store.requests.get(&endpoint).copied().unwrap_or_default()
    }

    /// Number of attempts received with `method`.
    pub fn requests_with(&self, method: Method) -> u64 {
        let store = self.store.lock().unwrap();
        store
            .requests
            .iter()
            .filter(|(endpoint, _)| endpoint.method() == method)
            .map(|(_, count)| count)
            .sum()
    }

    /// Number of owners currently stored.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().owners.len()
    }

    /// Returns `true` if no owners are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if an owner with this id exists.
    pub fn contains(&self, id: u64) -> bool {
        self.store.lock().unwrap().owners.contains_key(&id)
    }

    fn handle(&self, request: &Request) -> (u16, Bytes) {
        let mut store = self.store.lock().unwrap();

        let route = route(request);
        if let Some(endpoint) = route.map(|(endpoint, _)| endpoint) {
            *store.requests.entry(endpoint).or_default() += 1;
        }
        if let Some(status) = store.scripted.pop_front() {
            return (status, error_body("SCRIPTED"));
        }

        match route {
            Some((Endpoint::ListOwners, _)) => {
                let page: Vec<_> = store
                    .owners
                    .iter()
                    .take(LIST_PAGE_SIZE)
                    .map(|(&id, owner)| StoredOwner { id, owner })
                    .collect();
                (200, to_json(&page))
            }
            Some((Endpoint::GetOwner, Some(id))) => match store.owners.get(&id) {
                Some(owner) => (200, to_json(&StoredOwner { id, owner })),
                None => (404, error_body("NOT_FOUND")),
            },
            Some((Endpoint::CreateOwner, _)) => {
                let owner = match parse_owner(request) {
                    Ok(owner) => owner,
                    Err(body) => return (400, body),
                };
                if store.telephone_taken(&owner.telephone, None) {
                    return (409, error_body("DUPLICATE_TELEPHONE"));
                }
                store.next_id += 1;
                let id = store.next_id;
                let body = to_json(&StoredOwner { id, owner: &owner });
                store.insert(id, owner);
                (201, body)
            }
            Some((Endpoint::UpdateOwner, Some(id))) => {
                if !store.owners.contains_key(&id) {
                    return (404, error_body("NOT_FOUND"));
                }
                let owner = match parse_owner(request) {
                    Ok(owner) => owner,
                    Err(body) => return (400, body),
                };
                if store.telephone_taken(&owner.telephone, Some(id)) {
                    return (409, error_body("DUPLICATE_TELEPHONE"));
                }
                let body = to_json(&StoredOwner { id, owner: &owner });
                store.insert(id, owner);
                (200, body)
            }
            Some((Endpoint::DeleteOwner, Some(id))) => match store.remove(id) {
                Some(_) => (204, Bytes::new()),
                None => (404, error_body("NOT_FOUND")),
            },
            _ => (404, error_body("NOT_FOUND")),
        }
    }
}

impl Store {
    fn telephone_taken(&self, telephone: &str, except: Option<u64>) -> bool {
        self.telephones
            .get(telephone)
            .is_some_and(|&id| Some(id) != except)
    }

    fn insert(&mut self, id: u64, owner: Owner) {
        self.telephones.insert(owner.telephone.clone(), id);
        if let Some(previous) = self.owners.insert(id, owner) {
            if self.owners[&id].telephone != previous.telephone {
                self.telephones.remove(&previous.telephone);
            }
        }
    }

    fn remove(&mut self, id: u64) -> Option<Owner> {
        let owner = self.owners.remove(&id)?;
        self.telephones.remove(&owner.telephone);
        Some(owner)
    }
}

#[async_trait::async_trait]
impl Remote for InMemoryRemote {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn send(&self, request: &Request) -> RemoteResult<RawResponse> {
        let (status, body) = self.handle(request);
        Ok(RawResponse {
            status,
            body,
            request_id: None,
        })
    }
}

/// Resolves a request to its endpoint and the numeric owner id, if any.
///
/// Returns `None` for paths outside the owners API. An id segment that is not numeric resolves to
/// the endpoint with no id and ends up as `404`.
fn route(request: &Request) -> Option<(Endpoint, Option<u64>)> {
    let rest = request.path.strip_prefix("/owners")?;
    let rest = rest.trim_end_matches('/');

    if rest.is_empty() {
        return match request.method {
            Method::Get => Some((Endpoint::ListOwners, None)),
            Method::Post => Some((Endpoint::CreateOwner, None)),
            _ => None,
        };
    }

    let id = rest.strip_prefix('/')?.parse().ok();
    let endpoint = match request.method {
        Method::Get => Endpoint::GetOwner,
        Method::Put => Endpoint::UpdateOwner,
        Method::Delete => Endpoint::DeleteOwner,
        Method::Post => return None,
    };
    Some((endpoint, id))
}

fn parse_owner(request: &Request) -> Result<Owner, Bytes> {
    let body = request.body.as_deref().unwrap_or_default();
    let owner: Owner = serde_json::from_slice(body).map_err(|_| error_body("BAD_REQUEST"))?;

    let valid_name = |name: &str| {
        !name.is_empty()
            && name
                .split([' ', '\'', '-'])
                .all(|part| !part.is_empty() && part.chars().all(char::is_alphabetic))
    };
    let valid_phone = !owner.telephone.is_empty()
        && owner.telephone.len() <= 20
        && owner.telephone.chars().all(|c| c.is_ascii_digit());

    if valid_name(&owner.first_name) && valid_name(&owner.last_name) && valid_phone {
        Ok(owner)
    } else {
        Err(error_body("BAD_REQUEST"))
    }
}

fn to_json<T: Serialize>(value: &T) -> Bytes {
    serde_json::to_vec(value).map(Bytes::from).unwrap_or_default()
}

fn error_body(code: &str) -> Bytes {
    to_json(&serde_json::json!({ "error": code }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Origin, OwnerFactory, OwnerOverrides};

    fn request(method: Method, path: &str, owner: Option<&Owner>) -> Request {
        Request {
            method,
            path: path.into(),
            body: owner.map(|o| Bytes::from(serde_json::to_vec(o).unwrap())),
        }
    }

    fn owner(seq: u64) -> Owner {
        OwnerFactory::default().make(&OwnerOverrides::default(), Origin::Sequence(seq))
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let remote = InMemoryRemote::new();

        let created = remote
            .send(&request(Method::Post, "/owners", Some(&owner(1))))
            .await
            .unwrap();
        assert_eq!(created.status, 201);
        let json: serde_json::Value = serde_json::from_slice(&created.body).unwrap();
        assert_eq!(json["id"], 1);

        let read = remote.send(&request(Method::Get, "/owners/1", None)).await.unwrap();
        assert_eq!(read.status, 200);

        let updated = remote
            .send(&request(Method::Put, "/owners/1", Some(&owner(2))))
            .await
            .unwrap();
        assert_eq!(updated.status, 200);

        let deleted = remote.send(&request(Method::Delete, "/owners/1", None)).await.unwrap();
        assert_eq!(deleted.status, 204);

        let missing = remote.send(&request(Method::Get, "/owners/1", None)).await.unwrap();
        assert_eq!(missing.status, 404);
        assert!(remote.is_empty());
        assert_eq!(remote.requests_to(Endpoint::GetOwner), 2);
    }

    #[tokio::test]
    async fn rejects_duplicate_telephone() {
        let remote = InMemoryRemote::new();
        let first = owner(7);

        let created = remote.send(&request(Method::Post, "/owners", Some(&first))).await.unwrap();
        assert_eq!(created.status, 201);
        let duplicate = remote.send(&request(Method::Post, "/owners", Some(&first))).await.unwrap();
        assert_eq!(duplicate.status, 409);
    }

    #[tokio::test]
    async fn rejects_invalid_names() {
        let remote = InMemoryRemote::new();
        let mut invalid = owner(1);
        invalid.first_name = "R2D2".into();

        let response = remote.send(&request(Method::Post, "/owners", Some(&invalid))).await.unwrap();
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let remote = InMemoryRemote::new();
        remote.fail_next(503, 2);

        for _ in 0..2 {
            let response = remote.send(&request(Method::Get, "/owners", None)).await.unwrap();
            assert_eq!(response.status, 503);
        }
        let response = remote.send(&request(Method::Get, "/owners", None)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(remote.requests_with(Method::Get), 3);
    }
}
