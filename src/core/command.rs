use bytes::Bytes;

use crate::proto::frame::Frame;
use crate::Error;

/// A command ready to be sent to a node.
///
/// Commands are built using the builder pattern and converted to frames
/// for transmission over the connection.
///
/// # Example
///
/// ```
/// use slotmux::core::command::{get, Cmd};
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// assert_eq!(cmd.name(), "SET");
/// let get_cmd = get("key");
/// assert_eq!(get_cmd.args().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "DEL")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Appends an argument to the command.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[inline]
    pub fn args_from<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command name, upper-cased.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// Name followed by arguments.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Converts the command to a RESP Array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.args
                .into_iter()
                .map(|b| Frame::BulkString(Some(b)))
                .collect(),
        )
    }

    /// Recovers a command from a request frame.
    ///
    /// Returns `None` unless the frame is a non-empty array of bulk strings.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let Frame::Array(items) = frame else {
            return None;
        };
        let args = items
            .into_iter()
            .map(|item| match item {
                Frame::BulkString(Some(b)) => Some(b),
                Frame::SimpleString(s) => Some(Bytes::from(s)),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        if args.is_empty() {
            return None;
        }
        Some(Self { args })
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").arg(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").arg(key).arg(value)
}

/// Creates a DEL command over one or more keys.
#[inline]
pub fn del<I, K>(keys: I) -> Cmd
where
    I: IntoIterator<Item = K>,
    K: Into<Bytes>,
{
    Cmd::new("DEL").args_from(keys)
}

/// Creates an EXISTS command over one or more keys.
#[inline]
pub fn exists<I, K>(keys: I) -> Cmd
where
    I: IntoIterator<Item = K>,
    K: Into<Bytes>,
{
    Cmd::new("EXISTS").args_from(keys)
}

/// Creates an MGET command.
#[inline]
pub fn mget<I, K>(keys: I) -> Cmd
where
    I: IntoIterator<Item = K>,
    K: Into<Bytes>,
{
    Cmd::new("MGET").args_from(keys)
}

/// Creates an MSET command.
pub fn mset<I, K, V>(pairs: I) -> Cmd
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Bytes>,
    V: Into<Bytes>,
{
    pairs
        .into_iter()
        .fold(Cmd::new("MSET"), |cmd, (k, v)| cmd.arg(k).arg(v))
}

/// Creates an MSETNX command.
pub fn msetnx<I, K, V>(pairs: I) -> Cmd
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Bytes>,
    V: Into<Bytes>,
{
    pairs
        .into_iter()
        .fold(Cmd::new("MSETNX"), |cmd, (k, v)| cmd.arg(k).arg(v))
}

/// Creates a KEYS command.
#[inline]
pub fn keys(pattern: impl Into<Bytes>) -> Cmd {
    Cmd::new("KEYS").arg(pattern)
}

/// Creates a RANDOMKEY command.
#[inline]
pub fn randomkey() -> Cmd {
    Cmd::new("RANDOMKEY")
}

/// Creates a DBSIZE command.
#[inline]
pub fn dbsize() -> Cmd {
    Cmd::new("DBSIZE")
}

/// Creates a FLUSHALL command.
#[inline]
pub fn flushall() -> Cmd {
    Cmd::new("FLUSHALL")
}

/// Creates a FLUSHDB command.
#[inline]
pub fn flushdb() -> Cmd {
    Cmd::new("FLUSHDB")
}

/// Creates a SCRIPT FLUSH command.
#[inline]
pub fn script_flush() -> Cmd {
    Cmd::new("SCRIPT").arg("FLUSH")
}

/// Creates a SCRIPT KILL command.
#[inline]
pub fn script_kill() -> Cmd {
    Cmd::new("SCRIPT").arg("KILL")
}

/// Creates a CLIENT SETNAME command.
#[inline]
pub fn client_setname(name: impl Into<Bytes>) -> Cmd {
    Cmd::new("CLIENT").arg("SETNAME").arg(name)
}

/// Creates a CLIENT GETNAME command.
#[inline]
pub fn client_getname() -> Cmd {
    Cmd::new("CLIENT").arg("GETNAME")
}

/// Creates a CLIENT LIST command.
#[inline]
pub fn client_list() -> Cmd {
    Cmd::new("CLIENT").arg("LIST")
}

/// Creates a CONFIG SET command.
#[inline]
pub fn config_set(parameter: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("CONFIG").arg("SET").arg(parameter).arg(value)
}

/// Creates an EVAL command.
///
/// # Arguments
///
/// * `script` - Lua source
/// * `keys` - Keys the script touches
/// * `args` - Additional script arguments
pub fn eval<K, A>(script: impl Into<Bytes>, keys: Vec<K>, args: Vec<A>) -> Cmd
where
    K: Into<Bytes>,
    A: Into<Bytes>,
{
    Cmd::new("EVAL")
        .arg(script)
        .arg(keys.len().to_string())
        .args_from(keys)
        .args_from(args)
}

/// Creates an EVALSHA command.
pub fn evalsha<K, A>(sha: impl Into<Bytes>, keys: Vec<K>, args: Vec<A>) -> Cmd
where
    K: Into<Bytes>,
    A: Into<Bytes>,
{
    Cmd::new("EVALSHA")
        .arg(sha)
        .arg(keys.len().to_string())
        .args_from(keys)
        .args_from(args)
}

/// Creates a MULTI command.
#[inline]
pub fn multi() -> Cmd {
    Cmd::new("MULTI")
}

/// Creates an EXEC command.
#[inline]
pub fn exec() -> Cmd {
    Cmd::new("EXEC")
}

/// Converts an error reply into a typed error.
///
/// Recognizes `MOVED` and `ASK` redirects, `CLUSTERDOWN` and `CROSSSLOT`;
/// everything else becomes [`Error::Server`].
///
/// # Examples
///
/// ```
/// use slotmux::core::command::server_error;
/// use slotmux::Error;
///
/// let err = server_error(b"MOVED 3999 127.0.0.1:7000");
/// assert!(matches!(err, Error::Moved { slot: 3999, .. }));
/// ```
pub fn server_error(reply: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(reply);
    let msg = msg.trim();

    if let Some((slot, address)) = msg.strip_prefix("MOVED ").and_then(parse_redirect) {
        return Error::Moved { slot, address };
    }
    if let Some((slot, address)) = msg.strip_prefix("ASK ").and_then(parse_redirect) {
        return Error::Ask { slot, address };
    }
    if msg.starts_with("CLUSTERDOWN") {
        return Error::ClusterDown;
    }
    if msg.starts_with("CROSSSLOT") {
        return Error::CrossSlot;
    }
    Error::Server {
        message: msg.to_string(),
    }
}

/// Parses `<slot> <host>:<port>`.
fn parse_redirect(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot = parts.next()?.parse().ok()?;
    let address = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    Some((slot, address))
}

fn unexpected(what: &str) -> Error {
    Error::Protocol {
        message: format!("unexpected frame type, expected {}", what),
    }
}

/// Passes the frame through unless it is an error reply.
#[inline]
pub fn parse_frame_response(frame: Frame) -> Result<Frame, Error> {
    match frame {
        Frame::Error(e) => Err(server_error(&e)),
        _ => Ok(frame),
    }
}

/// Expects a status reply such as `+OK`.
pub fn frame_to_ok(frame: Frame) -> Result<(), Error> {
    match frame {
        Frame::SimpleString(_) => Ok(()),
        Frame::Error(e) => Err(server_error(&e)),
        _ => Err(unexpected("status reply")),
    }
}

/// Converts a frame to bytes.
pub fn frame_to_bytes(frame: Frame) -> Result<Option<Bytes>, Error> {
    match frame {
        Frame::BulkString(b) => Ok(b),
        Frame::SimpleString(s) => Ok(Some(Bytes::from(s))),
        Frame::Null => Ok(None),
        Frame::Error(e) => Err(server_error(&e)),
        _ => Err(unexpected("bulk string")),
    }
}

/// Converts a frame to an integer.
pub fn frame_to_int(frame: Frame) -> Result<i64, Error> {
    match frame {
        Frame::Integer(i) => Ok(i),
        Frame::BulkString(Some(b)) => std::str::from_utf8(&b)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| Error::Protocol {
                message: "invalid integer".to_string(),
            }),
        Frame::Error(e) => Err(server_error(&e)),
        _ => Err(unexpected("integer")),
    }
}

/// Converts a frame to a boolean.
pub fn frame_to_bool(frame: Frame) -> Result<bool, Error> {
    frame_to_int(frame).map(|i| i != 0)
}

/// Converts a frame array to a vector of optional bytes.
pub fn frame_to_vec_bytes(frame: Frame) -> Result<Vec<Option<Bytes>>, Error> {
    match frame {
        Frame::Array(arr) => arr.into_iter().map(frame_to_bytes).collect(),
        Frame::Error(e) => Err(server_error(&e)),
        _ => Err(unexpected("array")),
    }
}

/// Converts a frame array to a list of keys, skipping nulls.
pub fn frame_to_keys(frame: Frame) -> Result<Vec<Bytes>, Error> {
    frame_to_vec_bytes(frame).map(|items| items.into_iter().flatten().collect())
}

/// Converts a frame to a string.
pub fn frame_to_string(frame: Frame) -> Result<String, Error> {
    match frame {
        Frame::SimpleString(s) => Ok(String::from_utf8_lossy(&s).into_owned()),
        Frame::BulkString(Some(b)) => Ok(String::from_utf8_lossy(&b).into_owned()),
        Frame::BulkString(None) | Frame::Null => Ok(String::new()),
        Frame::Integer(i) => Ok(i.to_string()),
        Frame::Error(e) => Err(server_error(&e)),
        _ => Err(unexpected("string")),
    }
}

/// Returns the frame unchanged unless it is an error reply.
#[inline]
pub fn frame_to_frame(frame: Frame) -> Result<Frame, Error> {
    parse_frame_response(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_into_frame() {
        let cmd = Cmd::new("SET").arg("key").arg("value");
        assert_eq!(
            cmd.into_frame(),
            Frame::Array(vec![
                Frame::BulkString(Some("SET".into())),
                Frame::BulkString(Some("key".into())),
                Frame::BulkString(Some("value".into()))
            ])
        );
    }

    #[test]
    fn test_cmd_from_frame() {
        let frame = mset(vec![("a", "1"), ("b", "2")]).into_frame();
        let cmd = Cmd::from_frame(frame).unwrap();
        assert_eq!(cmd.name(), "MSET");
        assert_eq!(cmd.args().len(), 5);

        assert!(Cmd::from_frame(Frame::Array(vec![])).is_none());
        assert!(Cmd::from_frame(Frame::Integer(1)).is_none());
    }

    #[test]
    fn test_name_is_uppercased() {
        assert_eq!(Cmd::new("mget").name(), "MGET");
    }

    #[test]
    fn test_del_multiple_keys() {
        let cmd = del(vec!["a", "b"]);
        assert_eq!(
            cmd.into_frame(),
            Frame::Array(vec![
                Frame::BulkString(Some("DEL".into())),
                Frame::BulkString(Some("a".into())),
                Frame::BulkString(Some("b".into()))
            ])
        );
    }

    #[test]
    fn test_eval_cmd() {
        let cmd = eval("return 1", vec!["k1", "k2"], vec!["x"]);
        let args: Vec<&[u8]> = cmd.args().iter().map(|b| b.as_ref()).collect();
        assert_eq!(
            args,
            vec![
                &b"EVAL"[..],
                b"return 1",
                b"2",
                b"k1",
                b"k2",
                b"x"
            ]
        );
    }

    #[test]
    fn test_client_setname_cmd() {
        let cmd = client_setname("worker");
        assert_eq!(cmd.name(), "CLIENT");
        assert_eq!(cmd.args()[1], Bytes::from("SETNAME"));
        assert_eq!(cmd.args()[2], Bytes::from("worker"));
    }

    #[test]
    fn test_server_error_moved() {
        match server_error(b"MOVED 3999 127.0.0.1:7000") {
            Error::Moved { slot, address } => {
                assert_eq!(slot, 3999);
                assert_eq!(address, "127.0.0.1:7000");
            }
            other => panic!("Expected Moved error, got {:?}", other),
        }
    }

    #[test]
    fn test_server_error_ask() {
        match server_error(b"ASK 12345 192.168.1.100:6379") {
            Error::Ask { slot, address } => {
                assert_eq!(slot, 12345);
                assert_eq!(address, "192.168.1.100:6379");
            }
            other => panic!("Expected Ask error, got {:?}", other),
        }
    }

    #[test]
    fn test_server_error_cluster_states() {
        assert!(matches!(
            server_error(b"CLUSTERDOWN Hash slot not served"),
            Error::ClusterDown
        ));
        assert!(matches!(
            server_error(b"CROSSSLOT Keys in request don't hash to the same slot"),
            Error::CrossSlot
        ));
    }

    #[test]
    fn test_server_error_malformed_redirect() {
        assert!(matches!(
            server_error(b"MOVED notanumber 127.0.0.1:7000"),
            Error::Server { .. }
        ));
        assert!(matches!(server_error(b"MOVED 3999"), Error::Server { .. }));
    }

    #[test]
    fn test_server_error_generic() {
        match server_error(b"ERR unknown command") {
            Error::Server { message } => assert_eq!(message, "ERR unknown command"),
            other => panic!("Expected Server error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_to_ok() {
        assert!(frame_to_ok(Frame::ok()).is_ok());
        assert!(matches!(
            frame_to_ok(Frame::error("ERR nope")),
            Err(Error::Server { .. })
        ));
        assert!(frame_to_ok(Frame::Integer(1)).is_err());
    }

    #[test]
    fn test_frame_to_int() {
        assert_eq!(frame_to_int(Frame::Integer(42)).unwrap(), 42);
        assert_eq!(frame_to_int(Frame::bulk("7")).unwrap(), 7);
        assert!(frame_to_int(Frame::bulk("x")).is_err());
    }

    #[test]
    fn test_frame_to_vec_bytes() {
        let frame = Frame::Array(vec![Frame::bulk("a"), Frame::BulkString(None), Frame::Null]);
        assert_eq!(
            frame_to_vec_bytes(frame).unwrap(),
            vec![Some(Bytes::from("a")), None, None]
        );
    }

    #[test]
    fn test_frame_to_keys_skips_nulls() {
        let frame = Frame::Array(vec![Frame::bulk("a"), Frame::Null, Frame::bulk("b")]);
        assert_eq!(
            frame_to_keys(frame).unwrap(),
            vec![Bytes::from("a"), Bytes::from("b")]
        );
    }

    #[test]
    fn test_frame_to_bool() {
        assert!(frame_to_bool(Frame::Integer(1)).unwrap());
        assert!(!frame_to_bool(Frame::Integer(0)).unwrap());
    }
}
