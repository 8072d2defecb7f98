use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

use crate::{
    BlockPolicy, MaxLen, ReadPosition, StreamClient, StreamEntries, StreamEntry, StreamError,
    StreamValue, Values,
};

type EntryId = (u64, u64);

const ID_TOO_SMALL: &str =
    "The ID specified in XADD is equal or smaller than the target stream top item";
const KEY_REQUIRED: &str = "The XGROUP subcommand requires the key to exist";
const GROUP_EXISTS: &str = "Consumer Group name already exists";
const WRONG_ARITY: &str = "wrong number of arguments for 'xadd' command";

/// An in-memory stand-in for a Redis server's stream commands.
///
/// Consumer groups, pending entries lists, trimming and blocking reads behave like the
/// real commands, so the consumer protocol can be exercised without a server. Clones
/// share the same store. Errors can be injected per stream and command, and every call
/// is recorded.
#[derive(Clone, Default)]
pub struct MockStreamClient {
    store: Arc<Mutex<Store>>,
    appended: Arc<Notify>,
    xadd_error: HashMap<String, StreamError>,
    xread_group_error: HashMap<&'static str, StreamError>,
    xack_error: HashMap<String, StreamError>,
    calls: Arc<Mutex<Vec<MockStreamCall>>>,
}

#[derive(Debug, Clone)]
pub struct MockStreamCall {
    pub op: String,
    pub key: String,
    pub args: Vec<String>,
}

#[derive(Default)]
struct Store {
    streams: HashMap<String, StreamState>,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Vec<(String, Vec<u8>)>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    /// Delivered but unacknowledged entries and the consumer that owns each.
    pending: BTreeMap<EntryId, String>,
}

impl MockStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper method to safely lock the store mutex
    fn lock_store(&self) -> std::sync::MutexGuard<'_, Store> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<MockStreamCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: &str, key: &str, args: Vec<String>) {
        self.lock_calls().push(MockStreamCall {
            op: op.to_string(),
            key: key.to_string(),
            args,
        });
    }

    pub fn xadd_error(&mut self, stream: &str, err: StreamError) -> Self {
        self.xadd_error.insert(stream.to_owned(), err);
        self.clone()
    }

    pub fn xread_group_error(&mut self, position: ReadPosition, err: StreamError) -> Self {
        self.xread_group_error.insert(position.as_id(), err);
        self.clone()
    }

    pub fn xack_error(&mut self, stream: &str, err: StreamError) -> Self {
        self.xack_error.insert(stream.to_owned(), err);
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockStreamCall> {
        self.lock_calls().clone()
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.lock_store()
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    /// Number of entries pending for `consumer`, or for the whole group when `None`.
    pub fn pending_len(&self, stream: &str, group: &str, consumer: Option<&str>) -> usize {
        self.lock_store()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| {
                g.pending
                    .values()
                    .filter(|owner| consumer.is_none_or(|c| c == owner.as_str()))
                    .count()
            })
    }

    /// One attempt at a group read. An empty result means nothing was available.
    fn try_read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        position: ReadPosition,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntries>, StreamError> {
        let mut store = self.lock_store();

        for stream in streams {
            let exists = store
                .streams
                .get(stream)
                .is_some_and(|s| s.groups.contains_key(group));
            if !exists {
                return Err(no_group(stream, group));
            }
        }

        let mut reply = Vec::new();
        for stream in streams {
            let Some(state) = store.streams.get_mut(stream) else {
                continue;
            };
            let limit = count.unwrap_or(usize::MAX);
            let StreamState {
                entries, groups, ..
            } = state;
            let Some(group_state) = groups.get_mut(group) else {
                continue;
            };

            let delivered: Vec<StreamEntry> = match position {
                ReadPosition::Pending => group_state
                    .pending
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == consumer)
                    .take(limit)
                    .map(|(id, _)| to_entry(*id, entries.get(id)))
                    .collect(),
                ReadPosition::New => {
                    let after = Bound::Excluded(group_state.last_delivered);
                    let ids: Vec<EntryId> = entries
                        .range((after, Bound::Unbounded))
                        .take(limit)
                        .map(|(id, _)| *id)
                        .collect();
                    if let Some(last) = ids.last() {
                        group_state.last_delivered = *last;
                    }
                    for id in &ids {
                        group_state.pending.insert(*id, consumer.to_string());
                    }
                    ids.into_iter()
                        .map(|id| to_entry(id, entries.get(&id)))
                        .collect()
                }
            };

            // a pending read always reports the stream, a new read only when it has data
            if position == ReadPosition::Pending || !delivered.is_empty() {
                reply.push(StreamEntries {
                    stream: stream.clone(),
                    entries: delivered,
                });
            }
        }

        Ok(reply)
    }
}

// Error replies are built the way the client parses them off the wire: codes the redis
// crate does not know, like NOGROUP, become extension errors.
fn server_error(code: &str, detail: &str) -> StreamError {
    let err = redis::make_extension_error(code.to_string(), Some(detail.to_string()));
    StreamError::from(err)
}

fn response_error(detail: &'static str) -> StreamError {
    let kind = redis::ErrorKind::ResponseError;
    StreamError::from(redis::RedisError::from((kind, "ERR", detail.to_string())))
}

fn no_group(stream: &str, group: &str) -> StreamError {
    let detail = format!("No such key '{stream}' or consumer group '{group}'");
    server_error("NOGROUP", &detail)
}

fn invalid_id() -> StreamError {
    response_error("Invalid stream ID specified as stream command argument")
}

fn to_entry(id: EntryId, fields: Option<&Vec<(String, Vec<u8>)>>) -> StreamEntry {
    let values: Values = fields
        .map(|fields| {
            fields
                .iter()
                .map(|(k, v)| (k.clone(), StreamValue::from_wire_bytes(v.clone())))
                .collect()
        })
        .unwrap_or_default();

    StreamEntry {
        id: format_id(id),
        values,
    }
}

// The mock owns its id scheme, so it can order ids; callers never do.
fn format_id((ms, seq): EntryId) -> String {
    format!("{ms}-{seq}")
}

fn parse_id(id: &str) -> Option<EntryId> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

fn next_id((ms, seq): EntryId) -> EntryId {
    match seq.checked_add(1) {
        Some(seq) => (ms, seq),
        None => (ms + 1, 0),
    }
}

fn generate_id(last: EntryId) -> EntryId {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    if now > last.0 {
        (now, 0)
    } else {
        next_id(last)
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn xadd(
        &self,
        stream: String,
        id: String,
        values: Values,
        max_len: Option<MaxLen>,
        no_mkstream: bool,
    ) -> Result<Option<String>, StreamError> {
        let mut args = vec![id.clone()];
        args.extend(values.keys().cloned());
        self.record("xadd", &stream, args);

        if let Some(err) = self.xadd_error.get(&stream) {
            return Err(err.clone());
        }
        if values.is_empty() {
            return Err(response_error(WRONG_ARITY));
        }

        let assigned = {
            let mut store = self.lock_store();
            if no_mkstream && !store.streams.contains_key(&stream) {
                return Ok(None);
            }
            let state = store.streams.entry(stream.clone()).or_default();

            let new_id = if id == "*" {
                generate_id(state.last_id)
            } else {
                match parse_id(&id) {
                    Some(new_id) if new_id > state.last_id && new_id != (0, 0) => new_id,
                    Some(_) => return Err(response_error(ID_TOO_SMALL)),
                    None => return Err(invalid_id()),
                }
            };

            let fields = values
                .into_iter()
                .map(|(k, v)| (k, v.to_wire_bytes()))
                .collect();
            state.entries.insert(new_id, fields);
            state.last_id = new_id;

            let limit = match max_len {
                Some(MaxLen::Exact(n)) | Some(MaxLen::Approx(n)) => n,
                None => usize::MAX,
            };
            while state.entries.len() > limit {
                state.entries.pop_first();
            }

            format_id(new_id)
        };

        self.appended.notify_waiters();
        Ok(Some(assigned))
    }

    async fn xread_group(
        &self,
        group: String,
        consumer: String,
        streams: Vec<String>,
        position: ReadPosition,
        block: BlockPolicy,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntries>, StreamError> {
        self.record(
            "xread_group",
            &streams.join(","),
            vec![
                group.clone(),
                consumer.clone(),
                position.as_id().to_string(),
            ],
        );

        if let Some(err) = self.xread_group_error.get(position.as_id()) {
            return Err(err.clone());
        }

        // blocking only applies to new entries
        let deadline = match (position, block) {
            (ReadPosition::Pending, _) | (_, BlockPolicy::NoBlock) => {
                return self.try_read_group(&group, &consumer, &streams, position, count);
            }
            (_, BlockPolicy::Forever) => None,
            (_, BlockPolicy::Timeout(timeout)) => Some(tokio::time::Instant::now() + timeout),
        };

        loop {
            // registered before checking, so an append in between still wakes us
            let appended = self.appended.notified();

            let reply = self.try_read_group(&group, &consumer, &streams, position, count)?;
            if !reply.is_empty() {
                return Ok(reply);
            }

            match deadline {
                None => appended.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, appended).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    async fn xack(
        &self,
        stream: String,
        group: String,
        ids: Vec<String>,
    ) -> Result<u64, StreamError> {
        self.record("xack", &stream, ids.clone());

        if let Some(err) = self.xack_error.get(&stream) {
            return Err(err.clone());
        }

        let mut parsed = Vec::with_capacity(ids.len());
        for id in &ids {
            parsed.push(parse_id(id).ok_or_else(invalid_id)?);
        }

        // a missing stream or group acknowledges nothing
        let mut store = self.lock_store();
        let Some(state) = store.streams.get_mut(&stream) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(&group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in parsed {
            if group_state.pending.remove(&id).is_some() {
                acked += 1;
            }
        }

        Ok(acked)
    }

    async fn xgroup_create(
        &self,
        stream: String,
        group: String,
        start_id: String,
        mkstream: bool,
    ) -> Result<(), StreamError> {
        self.record(
            "xgroup_create",
            &stream,
            vec![group.clone(), start_id.clone()],
        );

        let mut store = self.lock_store();
        if !mkstream && !store.streams.contains_key(&stream) {
            return Err(response_error(KEY_REQUIRED));
        }
        let state = store.streams.entry(stream).or_default();
        if state.groups.contains_key(&group) {
            return Err(server_error("BUSYGROUP", GROUP_EXISTS));
        }

        let last_delivered = if start_id == "$" {
            state.last_id
        } else {
            parse_id(&start_id).ok_or_else(invalid_id)?
        };
        state.groups.insert(
            group,
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );

        Ok(())
    }

    async fn xgroup_destroy(&self, stream: String, group: String) -> Result<bool, StreamError> {
        self.record("xgroup_destroy", &stream, vec![group.clone()]);

        let mut store = self.lock_store();
        match store.streams.get_mut(&stream) {
            Some(state) => Ok(state.groups.remove(&group).is_some()),
            None => Err(response_error(KEY_REQUIRED)),
        }
    }

    async fn del(&self, stream: String) -> Result<(), StreamError> {
        self.record("del", &stream, Vec::new());

        self.lock_store().streams.remove(&stream);
        Ok(())
    }
}
