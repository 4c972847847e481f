/// Longest key the text protocol accepts.
pub const MAX_KEY_LEN: usize = 250;

/// An item to be stored in, or returned from, a memcached server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    /// The item's key (250 bytes maximum).
    pub key: String,
    pub value: Vec<u8>,
    /// Server-opaque flags whose meaning is up to the application.
    pub flags: u32,
    /// Expiration in seconds: relative when below 30 days, otherwise an
    /// absolute Unix time. Zero means the item never expires.
    pub expiration: i32,
    pub(crate) cas_id: u64,
}

impl Item {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_expiration(mut self, expiration: i32) -> Self {
        self.expiration = expiration;
        self
    }

    /// CAS token returned by the server on the read that produced this item.
    pub fn cas_id(&self) -> u64 {
        self.cas_id
    }
}

/// Checks a key against the text protocol's rules: at most 250 bytes and no
/// whitespace, control or DEL bytes.
pub fn legal_key(key: &str) -> bool {
    key.len() <= MAX_KEY_LEN && key.bytes().all(|b| b > b' ' && b != 0x7f)
}
