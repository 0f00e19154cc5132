use thiserror::Error;

/// DNS, connect, TLS and timeout failures. Retried on the next trigger only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("reading response body failed: {0}")]
    Read(String),
    #[error("redirect limit of {limit} exceeded while fetching {url}")]
    TooManyRedirects { url: String, limit: u8 },
    #[error("redirect status {status} from {url} carried no Location header")]
    MissingLocation { url: String, status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected HTTP {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("unexpected content type `{0}`")]
    UnexpectedContentType(String),
    #[error("release list is empty")]
    EmptyReleaseList,
    #[error("no stable release found")]
    NoStableRelease,
    #[error("release {tag} is missing asset(s): {missing}")]
    MissingAssets { tag: String, missing: String },
    #[error("signature artifact has {len} bytes, expected {expected}")]
    MalformedSignature { len: usize, expected: usize },
    #[error("firmware image body is empty")]
    EmptyImage,
    #[error("firmware image exceeds slot capacity of {capacity} bytes")]
    ImageTooLarge { capacity: u64 },
}

/// Security gate failures. The written slot is never marked bootable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("image length mismatch: slot declares {declared} bytes, signature expects {expected}")]
    LengthMismatch { declared: u64, expected: u64 },
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("signature verification failed")]
    BadSignature,
    #[error("embedded public key is invalid")]
    InvalidPublicKey,
    #[error("slot {0} holds no valid image header")]
    MissingImageHeader(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("opening namespace `{namespace}` failed: {reason}")]
    Open { namespace: String, reason: String },
    #[error("namespace `{0}` is opened read-only")]
    ReadOnly(String),
    #[error("reading `{key}` failed: {reason}")]
    Read { key: String, reason: String },
    #[error("writing `{key}` failed: {reason}")]
    Write { key: String, reason: String },
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("value of `{key}` is corrupt: {reason}")]
    Decode { key: String, reason: String },
    #[error("slot `{0}` not found")]
    SlotNotFound(String),
    #[error("flash operation on `{slot}` failed: {reason}")]
    Flash { slot: String, reason: String },
    #[error("range {offset}+{len} is outside slot `{slot}`")]
    OutOfBounds { slot: String, offset: u64, len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("no inactive slot available")]
    NoInactiveSlot,
    #[error("refusing to write the running slot `{0}`")]
    RunningSlot(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    State(#[from] StateError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
