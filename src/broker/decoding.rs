use fred::{
    prelude::{RedisError, RedisErrorKind, RedisResult},
    types::{FromRedis, RedisKey, RedisValue},
};
use tracing::{debug, trace};

pub const PAYLOAD_FIELD: &str = "payload";

fn parse_error(details: &'static str) -> RedisError {
    RedisError::new(RedisErrorKind::Parse, details)
}

/// A single stream entry. `payload` is missing when the entry was deleted after delivery.
#[derive(Debug, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Option<String>,
}

impl FromRedis for StreamEntry {
    fn from_value(value: RedisValue) -> RedisResult<Self> {
        let mut iter = value.into_array().into_iter();

        // Index 0 is the entry id, index 1 the field-value pairs.
        let id: String = iter
            .next()
            .ok_or_else(|| parse_error("expected entry id at index 0"))?
            .convert()?;

        let payload = match iter.next() {
            None | Some(RedisValue::Null) => None,
            Some(fields) => fields
                .into_map()?
                .get(&RedisKey::from_static_str(PAYLOAD_FIELD))
                .and_then(RedisValue::as_string),
        };

        Ok(Self { id, payload })
    }
}

pub struct XReadGroupResponse(pub Vec<StreamEntry>);

impl FromRedis for XReadGroupResponse {
    fn from_value(value: RedisValue) -> RedisResult<Self> {
        trace!(x_read_group_response_raw = ?value);
        match value {
            RedisValue::Array(streams) => {
                let mut entries = Vec::new();

                for stream in streams {
                    let mut iter = stream.into_array().into_iter();

                    // Index 0 is stream name, index 1 is messages.
                    iter.next()
                        .ok_or_else(|| parse_error("expected stream name at index 0"))?;
                    let messages = iter
                        .next()
                        .ok_or_else(|| parse_error("expected messages at index 1"))?
                        .into_array();

                    for message in messages {
                        entries.push(message.convert::<StreamEntry>()?);
                    }
                }

                Ok(Self(entries))
            }
            RedisValue::Null => Ok(Self(Vec::new())),
            _ => Err(parse_error(
                "expected RedisValue::Array containing streams",
            )),
        }
    }
}

/// Reply to `XAUTOCLAIM`: the cursor to continue from and the claimed entries.
///
/// Redis v6 returns entries deleted while pending as nil, those are skipped. Redis v7 drops them
/// from the pending list itself and lists their ids in a third element we ignore.
pub struct XAutoClaimResponse(pub String, pub Vec<StreamEntry>);

impl FromRedis for XAutoClaimResponse {
    fn from_value(value: RedisValue) -> RedisResult<Self> {
        trace!(x_auto_claim_response_raw = ?value);
        let mut iter = value.into_array().into_iter();
        let next_autoclaim_id: String = iter
            .next()
            .ok_or_else(|| parse_error("expected autoclaim id at index 0"))?
            .convert()?;
        let messages = iter
            .next()
            .ok_or_else(|| parse_error("expected claimed messages at index 1"))?
            .into_array();

        let mut entries = Vec::with_capacity(messages.len());
        for message in messages {
            if message.is_null() {
                debug!("received nil message in XAUTOCLAIM response, skipping");
                continue;
            }
            entries.push(message.convert::<StreamEntry>()?);
        }

        Ok(Self(next_autoclaim_id, entries))
    }
}

#[derive(Debug, PartialEq)]
pub struct ConsumerInfo {
    pub idle: u64,
    pub name: String,
    pub pending: u64,
}

impl FromRedis for ConsumerInfo {
    fn from_value(value: RedisValue) -> RedisResult<Self> {
        let info = value.into_map()?;
        let field = |name: &'static str| {
            info.get(&RedisKey::from_static_str(name))
                .ok_or_else(|| parse_error("missing field in XINFO CONSUMERS entry"))
        };

        let idle = field("idle")?
            .as_u64()
            .ok_or_else(|| parse_error("expected 'idle' field to be a u64"))?;
        let name = field("name")?
            .as_string()
            .ok_or_else(|| parse_error("expected 'name' field to be a string"))?;
        let pending = field("pending")?
            .as_u64()
            .ok_or_else(|| parse_error("expected 'pending' field to be a u64"))?;

        Ok(Self {
            idle,
            name,
            pending,
        })
    }
}
