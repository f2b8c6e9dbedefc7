/// Opaque identifier handed out by the backend on submission.
pub type JobId = String;
pub type Envs = Vec<(String, String)>;
/// Serialized (JSON) argument or result of one array item.
pub type Payload = bytes::Bytes;
pub type ArrayIndex = usize;
