//! Text protocol codec.
//!
//! Every exchange is one request followed by exactly one logical response:
//! a single line, or a run of `VALUE` blocks closed by `END`. Responses are
//! decoded straight off the buffered connection, so values of any size are
//! read in full.

use super::error::{MemcacheError, Result};
use super::item::Item;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CRLF: &[u8] = b"\r\n";

/// Largest value a `VALUE` header may declare, matching memcached's default
/// item size limit.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Storage command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Cas,
}

impl StoreVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreVerb::Set => "set",
            StoreVerb::Add => "add",
            StoreVerb::Replace => "replace",
            StoreVerb::Cas => "cas",
        }
    }
}

/// Requests the client sends
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    Store { verb: StoreVerb, item: &'a Item },
    Gets { keys: Vec<&'a str> },
    Delete { key: &'a str },
    /// `flush_all` answered like a delete (`DELETED` or `OK`).
    DeleteAll,
    /// `flush_all` that must be answered with `OK`.
    FlushAll,
    Touch { key: &'a str, seconds: i32 },
    Incr { key: &'a str, delta: u64 },
    Decr { key: &'a str, delta: u64 },
}

impl Command<'_> {
    /// Serialize this command into its wire form
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Store { verb, item } => {
                let mut line = format!(
                    "{} {} {} {} {}",
                    verb.as_str(),
                    item.key,
                    item.flags,
                    item.expiration,
                    item.value.len()
                );
                if *verb == StoreVerb::Cas {
                    line.push_str(&format!(" {}", item.cas_id));
                }
                line.push_str("\r\n");

                let mut buf = Vec::with_capacity(line.len() + item.value.len() + CRLF.len());
                buf.extend_from_slice(line.as_bytes());
                buf.extend_from_slice(&item.value);
                buf.extend_from_slice(CRLF);
                buf
            }
            Command::Gets { keys } => format!("gets {}\r\n", keys.join(" ")).into_bytes(),
            Command::Delete { key } => format!("delete {}\r\n", key).into_bytes(),
            Command::DeleteAll | Command::FlushAll => b"flush_all\r\n".to_vec(),
            Command::Touch { key, seconds } => format!("touch {} {}\r\n", key, seconds).into_bytes(),
            Command::Incr { key, delta } => format!("incr {} {}\r\n", key, delta).into_bytes(),
            Command::Decr { key, delta } => format!("decr {} {}\r\n", key, delta).into_bytes(),
        }
    }

    /// Command verb, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::Store { verb, .. } => verb.as_str(),
            Command::Gets { .. } => "gets",
            Command::Delete { .. } => "delete",
            Command::DeleteAll | Command::FlushAll => "flush_all",
            Command::Touch { .. } => "touch",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
        }
    }
}

/// A single response line, classified
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseLine {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    End,
    ClientError(String),
    ServerError(String),
    /// Anything else, including numeric incr/decr results and `VALUE` headers
    Other,
}

impl ResponseLine {
    /// Classify a line that still carries its trailing CRLF
    pub fn parse(line: &[u8]) -> Self {
        let Some(body) = line.strip_suffix(CRLF) else {
            return ResponseLine::Other;
        };

        match body {
            b"STORED" => ResponseLine::Stored,
            b"NOT_STORED" => ResponseLine::NotStored,
            b"EXISTS" => ResponseLine::Exists,
            b"NOT_FOUND" => ResponseLine::NotFound,
            b"DELETED" => ResponseLine::Deleted,
            b"TOUCHED" => ResponseLine::Touched,
            b"OK" => ResponseLine::Ok,
            b"END" => ResponseLine::End,
            _ => {
                if let Some(msg) = body.strip_prefix(b"CLIENT_ERROR ") {
                    ResponseLine::ClientError(String::from_utf8_lossy(msg).into_owned())
                } else if let Some(msg) = body.strip_prefix(b"SERVER_ERROR ") {
                    ResponseLine::ServerError(String::from_utf8_lossy(msg).into_owned())
                } else {
                    ResponseLine::Other
                }
            }
        }
    }
}

/// Successful outcome of a round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Stored,
    Deleted,
    Ok,
    Touched,
    /// New value after incr/decr
    Counter(u64),
    /// End of a `gets` response; the items went to the callback
    End,
}

/// Writes `command`, flushes, and reads its response. Items from a `gets`
/// response are handed to `on_item` as soon as each one is decoded, and any
/// value declared larger than `max_value_size` is rejected.
pub async fn round_trip<S>(
    rw: &mut S,
    command: &Command<'_>,
    max_value_size: usize,
    on_item: &mut (dyn FnMut(Item) + Send),
) -> Result<Reply>
where
    S: AsyncBufRead + AsyncWrite + Unpin + Send,
{
    rw.write_all(&command.encode()).await?;
    rw.flush().await?;
    read_reply(rw, command, max_value_size, on_item).await
}

/// Reads the response to an already-sent `command`
pub async fn read_reply<R>(
    r: &mut R,
    command: &Command<'_>,
    max_value_size: usize,
    on_item: &mut (dyn FnMut(Item) + Send),
) -> Result<Reply>
where
    R: AsyncBufRead + Unpin + Send,
{
    match command {
        Command::Store { .. } => read_store_reply(r).await,
        Command::Gets { .. } => read_get_response(r, max_value_size, on_item)
            .await
            .map(|_| Reply::End),
        Command::Delete { .. } | Command::DeleteAll => read_delete_reply(r).await,
        Command::FlushAll => read_flush_reply(r).await,
        Command::Touch { .. } => read_touch_reply(r).await,
        Command::Incr { .. } | Command::Decr { .. } => {
            read_counter_reply(r).await.map(Reply::Counter)
        }
    }
}

/// Reads one CRLF-terminated line, terminator included
pub async fn read_line<R>(r: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = Vec::new();
    r.read_until(b'\n', &mut line).await?;
    if !line.ends_with(b"\n") {
        return Err(MemcacheError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-response",
        )));
    }
    Ok(line)
}

pub async fn read_store_reply<R>(r: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_line(r).await?;
    match ResponseLine::parse(&line) {
        ResponseLine::Stored => Ok(Reply::Stored),
        ResponseLine::NotStored => Err(MemcacheError::NotStored),
        ResponseLine::Exists => Err(MemcacheError::CasConflict),
        ResponseLine::NotFound => Err(MemcacheError::CacheMiss),
        ResponseLine::ServerError(msg) => Err(MemcacheError::ServerError(msg)),
        _ => Err(MemcacheError::unexpected(&line)),
    }
}

pub async fn read_delete_reply<R>(r: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_line(r).await?;
    match ResponseLine::parse(&line) {
        ResponseLine::Deleted => Ok(Reply::Deleted),
        ResponseLine::Ok => Ok(Reply::Ok),
        ResponseLine::NotStored => Err(MemcacheError::NotStored),
        ResponseLine::Exists => Err(MemcacheError::CasConflict),
        ResponseLine::NotFound => Err(MemcacheError::CacheMiss),
        ResponseLine::ServerError(msg) => Err(MemcacheError::ServerError(msg)),
        _ => Err(MemcacheError::unexpected(&line)),
    }
}

pub async fn read_flush_reply<R>(r: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_line(r).await?;
    match ResponseLine::parse(&line) {
        ResponseLine::Ok => Ok(Reply::Ok),
        ResponseLine::ServerError(msg) => Err(MemcacheError::ServerError(msg)),
        _ => Err(MemcacheError::unexpected(&line)),
    }
}

pub async fn read_touch_reply<R>(r: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_line(r).await?;
    match ResponseLine::parse(&line) {
        ResponseLine::Touched => Ok(Reply::Touched),
        ResponseLine::NotFound => Err(MemcacheError::CacheMiss),
        ResponseLine::ServerError(msg) => Err(MemcacheError::ServerError(msg)),
        _ => Err(MemcacheError::unexpected(&line)),
    }
}

/// Reads an incr/decr result.
///
/// memcached may space-pad a decremented value that got shorter, so trailing
/// spaces are ignored.
pub async fn read_counter_reply<R>(r: &mut R) -> Result<u64>
where
    R: AsyncBufRead + Unpin + Send,
{
    let line = read_line(r).await?;
    match ResponseLine::parse(&line) {
        ResponseLine::NotFound => Err(MemcacheError::CacheMiss),
        ResponseLine::ClientError(msg) => Err(MemcacheError::ClientError(msg)),
        ResponseLine::ServerError(msg) => Err(MemcacheError::ServerError(msg)),
        ResponseLine::Other => line
            .strip_suffix(CRLF)
            .and_then(|body| std::str::from_utf8(body).ok())
            .and_then(|s| s.trim_end_matches(' ').parse::<u64>().ok())
            .ok_or_else(|| MemcacheError::unexpected(&line)),
        _ => Err(MemcacheError::unexpected(&line)),
    }
}

/// Reads `VALUE` blocks until `END`, calling `on_item` for each.
///
/// If a block turns out to be corrupt the error is returned, but items
/// already passed to `on_item` stay delivered.
pub async fn read_get_response<R>(
    r: &mut R,
    max_value_size: usize,
    on_item: &mut (dyn FnMut(Item) + Send),
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
{
    loop {
        let line = read_line(r).await?;
        match ResponseLine::parse(&line) {
            ResponseLine::End => return Ok(()),
            ResponseLine::ServerError(msg) => return Err(MemcacheError::ServerError(msg)),
            _ => {}
        }

        let (mut item, size) = scan_value_line(&line)?;
        let block_len = match size.checked_add(CRLF.len()) {
            Some(len) if size <= max_value_size => len,
            _ => return Err(MemcacheError::unexpected(&line)),
        };

        let mut value = Vec::with_capacity(block_len);
        (&mut *r)
            .take(block_len as u64)
            .read_to_end(&mut value)
            .await?;
        if value.len() < block_len {
            return Err(MemcacheError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-value",
            )));
        }
        if !value.ends_with(CRLF) {
            return Err(MemcacheError::CorruptValue { key: item.key });
        }
        value.truncate(size);
        item.value = value;

        on_item(item);
    }
}

/// Parses a `VALUE <key> <flags> <bytes>[ <cas>]` header into an item
/// without its value, plus the declared value length.
pub fn scan_value_line(line: &[u8]) -> Result<(Item, usize)> {
    let bad_line = || MemcacheError::unexpected(line);

    let body = line.strip_suffix(CRLF).ok_or_else(bad_line)?;
    let has_cas = match body.iter().filter(|&&b| b == b' ').count() {
        3 => false,
        4 => true,
        _ => return Err(bad_line()),
    };

    let text = std::str::from_utf8(body).map_err(|_| bad_line())?;
    let mut fields = text.split(' ');
    if fields.next() != Some("VALUE") {
        return Err(bad_line());
    }

    let key = fields.next().filter(|k| !k.is_empty()).ok_or_else(bad_line)?;
    let flags = fields
        .next()
        .and_then(|f| f.parse::<u32>().ok())
        .ok_or_else(bad_line)?;
    let size = fields
        .next()
        .and_then(|f| f.parse::<usize>().ok())
        .ok_or_else(bad_line)?;
    let cas_id = if has_cas {
        fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(bad_line)?
    } else {
        0
    };

    let item = Item {
        key: key.to_string(),
        flags,
        cas_id,
        ..Default::default()
    };
    Ok((item, size))
}
