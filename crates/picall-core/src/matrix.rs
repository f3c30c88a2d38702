//! Matrix client-server API backend over `reqwest`.

use std::cell::RefCell;
use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::backend::Backend;
use crate::errors::PicallError;
use crate::events::{RoomSummary, SyncBatch, TimelineEvent};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    state: EventList,
    #[serde(default)]
    timeline: EventList,
}

#[derive(Debug, Default, Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    sender: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    unsigned: Unsigned,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Unsigned {
    #[serde(default)]
    age: Option<u64>,
}

impl RawEvent {
    fn into_event(self, room_id: &str) -> TimelineEvent {
        TimelineEvent {
            event_id: self.event_id,
            room_id: room_id.to_string(),
            sender: self.sender,
            event_type: self.event_type,
            content: self.content,
            age_ms: self.unsigned.age,
        }
    }
}

/// Authenticated session with a homeserver.
pub struct MatrixBackend {
    http: Client,
    homeserver: String,
    user_id: String,
    access_token: RefCell<Option<String>>,
    since: RefCell<Option<String>>,
}

impl MatrixBackend {
    pub fn new(homeserver: &str, user_id: &str) -> Result<Self, PicallError> {
        let parsed = url::Url::parse(homeserver)
            .map_err(|e| PicallError::Config(format!("invalid homeserver url '{homeserver}': {e}")))?;
        Ok(Self {
            http: Client::new(),
            homeserver: parsed.as_str().trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            access_token: RefCell::new(None),
            since: RefCell::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.homeserver, path)
    }

    fn authed(&self, request: RequestBuilder) -> Result<RequestBuilder, PicallError> {
        let token = self.access_token.borrow();
        let token = token
            .as_deref()
            .ok_or_else(|| PicallError::Auth("not logged in".into()))?;
        Ok(request.bearer_auth(token))
    }

    async fn execute(request: RequestBuilder) -> Result<Response, PicallError> {
        let resp = request
            .send()
            .await
            .map_err(|e| PicallError::Connection(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let detail = match resp.json::<ErrorResponse>().await {
            Ok(err) => format!("{} {}", err.errcode, err.error),
            Err(_) => String::from("no error body"),
        };
        Err(PicallError::Http(format!("{status}: {}", detail.trim())))
    }
}

#[async_trait(?Send)]
impl Backend for MatrixBackend {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn login(&self, password: &str) -> Result<(), PicallError> {
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": self.user_id },
            "password": password,
            "initial_device_display_name": "picall",
        });
        let request = self.http.post(self.endpoint("/_matrix/client/v3/login")).json(&body);

        let resp = Self::execute(request)
            .await
            .map_err(|e| PicallError::Auth(e.to_string()))?;
        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| PicallError::Auth(format!("invalid login response: {e}")))?;

        tracing::info!(user_id = %self.user_id, device_id = ?login.device_id, "logged in");
        *self.access_token.borrow_mut() = Some(login.access_token);
        Ok(())
    }

    async fn sync(&self, timeout_ms: u64) -> Result<SyncBatch, PicallError> {
        let mut query = vec![("timeout", timeout_ms.to_string())];
        if let Some(since) = self.since.borrow().as_ref() {
            query.push(("since", since.clone()));
        }
        let request = self
            .authed(self.http.get(self.endpoint("/_matrix/client/v3/sync")))?
            .query(&query);

        let raw: SyncResponse = Self::execute(request)
            .await?
            .json()
            .await
            .map_err(|e| PicallError::Http(format!("invalid sync response: {e}")))?;

        let batch = sync_batch(raw);
        *self.since.borrow_mut() = Some(batch.next_batch.clone());
        Ok(batch)
    }

    async fn room_messages(
        &self,
        room_id: &str,
        from: &str,
        limit: u32,
    ) -> Result<Vec<TimelineEvent>, PicallError> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/messages",
            urlencoding::encode(room_id)
        );
        let request = self.authed(self.http.get(self.endpoint(&path)))?.query(&[
            ("from", from.to_string()),
            ("dir", "b".to_string()),
            ("limit", limit.to_string()),
        ]);

        let resp: MessagesResponse = Self::execute(request)
            .await?
            .json()
            .await
            .map_err(|e| PicallError::Http(format!("invalid messages response: {e}")))?;

        Ok(resp
            .chunk
            .into_iter()
            .map(|ev| ev.into_event(room_id))
            .collect())
    }

    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, PicallError> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_type),
            txn_id
        );
        let request = self.authed(self.http.put(self.endpoint(&path)))?.json(&content);

        let resp: SendResponse = Self::execute(request)
            .await?
            .json()
            .await
            .map_err(|e| PicallError::Http(format!("invalid send response: {e}")))?;

        tracing::debug!(room_id, event_type, event_id = %resp.event_id, "event sent");
        Ok(resp.event_id)
    }

    async fn upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, PicallError> {
        let request = self
            .authed(self.http.post(self.endpoint("/_matrix/media/v3/upload")))?
            .query(&[("filename", filename)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data);

        let resp: UploadResponse = Self::execute(request)
            .await?
            .json()
            .await
            .map_err(|e| PicallError::Http(format!("invalid upload response: {e}")))?;
        Ok(resp.content_uri)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, PicallError> {
        let path = download_path(url)?;
        let request = self.authed(self.http.get(self.endpoint(&path)))?;

        let bytes = Self::execute(request)
            .await?
            .bytes()
            .await
            .map_err(|e| PicallError::Http(format!("download body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Split `mxc://server/media_id` into its parts.
fn parse_mxc(url: &str) -> Result<(&str, &str), PicallError> {
    let rest = url
        .strip_prefix("mxc://")
        .ok_or_else(|| PicallError::Http(format!("not a content uri: '{url}'")))?;
    match rest.split_once('/') {
        Some((server, id)) if !server.is_empty() && !id.is_empty() && !id.contains('/') => {
            Ok((server, id))
        }
        _ => Err(PicallError::Http(format!("malformed content uri: '{url}'"))),
    }
}

/// Authenticated media download path for a content uri.
fn download_path(url: &str) -> Result<String, PicallError> {
    let (server, media_id) = parse_mxc(url)?;
    Ok(format!(
        "/_matrix/client/v1/media/download/{}/{}",
        urlencoding::encode(server),
        urlencoding::encode(media_id)
    ))
}

fn sync_batch(raw: SyncResponse) -> SyncBatch {
    let mut rooms = Vec::new();
    let mut events = Vec::new();

    let mut joined: Vec<(String, JoinedRoom)> = raw.rooms.join.into_iter().collect();
    joined.sort_by(|a, b| a.0.cmp(&b.0));

    for (room_id, room) in joined {
        let display_name = room_name(room.state.events.iter().chain(&room.timeline.events));
        rooms.push(RoomSummary {
            room_id: room_id.clone(),
            display_name,
        });
        events.extend(
            room.timeline
                .events
                .into_iter()
                .map(|ev| ev.into_event(&room_id)),
        );
    }

    SyncBatch {
        next_batch: raw.next_batch,
        rooms,
        events,
    }
}

/// Latest `m.room.name`, else latest canonical alias.
fn room_name<'a>(events: impl Iterator<Item = &'a RawEvent>) -> Option<String> {
    let mut name = None;
    let mut alias = None;
    for ev in events {
        match ev.event_type.as_str() {
            "m.room.name" => {
                name = ev.content.get("name").and_then(Value::as_str).map(str::to_string);
            }
            "m.room.canonical_alias" => {
                alias = ev.content.get("alias").and_then(Value::as_str).map(str::to_string);
            }
            _ => {}
        }
    }
    name.filter(|n| !n.is_empty()).or(alias)
}
