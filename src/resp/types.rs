use bytes::Bytes;

/// A decoded RESP reply (RESP2 + full RESP3).
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n  (classification happens in `error::ServerErrorKind`)
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// *2\r\n…
    Array(Vec<Reply>),
    /// $-1\r\n or *-1\r\n (RESP2), _\r\n (RESP3)
    Null,
    /// ,3.14\r\n (RESP3)
    Double(f64),
    /// #t\r\n or #f\r\n (RESP3)
    Boolean(bool),
    /// (3492890328409238509324850943850943825024385\r\n (RESP3)
    BigNumber(String),
    /// %N\r\n (RESP3 map)
    Map(Vec<(Reply, Reply)>),
    /// ~N\r\n (RESP3 set)
    Set(Vec<Reply>),
    /// =15\r\ntxt:Some string\r\n (RESP3)
    Verbatim { format: String, text: String },
    /// !21\r\nSYNTAX invalid syntax\r\n (RESP3 bulk error)
    BulkError(String),
    /// >N\r\n… (RESP3 out-of-band push)
    Push { kind: String, data: Vec<Reply> },
    /// |N\r\n… (RESP3 attribute metadata wrapping the real reply)
    Attribute {
        data: Box<Reply>,
        attrs: Vec<(Reply, Reply)>,
    },
}

impl Reply {
    /// View as UTF-8 text where the variant carries text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(b) => std::str::from_utf8(b).ok(),
            Self::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }

    /// View as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::BulkString(b) => Some(b),
            Self::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<Vec<(Reply, Reply)>> {
        match self {
            Self::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True when the reply is the simple string `OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::SimpleString(s) if s == "OK")
    }

    /// True when this is a server error (simple or bulk).
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_) | Self::BulkError(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(msg) | Self::BulkError(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Self::Push { .. })
    }

    /// Static name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple_string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk_string",
            Self::Array(_) => "array",
            Self::Null => "null",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::BigNumber(_) => "big_number",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Verbatim { .. } => "verbatim_string",
            Self::BulkError(_) => "bulk_error",
            Self::Push { .. } => "push",
            Self::Attribute { .. } => "attribute",
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_variants() {
        assert_eq!(Reply::SimpleString("OK".into()).as_str(), Some("OK"));
        assert_eq!(
            Reply::BulkString(Bytes::from_static(b"hello")).as_str(),
            Some("hello")
        );
        assert_eq!(
            Reply::Verbatim {
                format: "txt".into(),
                text: "hello world".into()
            }
            .as_str(),
            Some("hello world")
        );
        assert_eq!(Reply::Integer(42).as_str(), None);
        assert_eq!(Reply::Null.as_str(), None);
    }

    #[test]
    fn as_str_rejects_invalid_utf8() {
        let v = Reply::BulkString(Bytes::from_static(&[0xff, 0xfe]));
        assert_eq!(v.as_str(), None);
    }

    #[test]
    fn as_bytes_variants() {
        assert_eq!(
            Reply::BulkString(Bytes::from_static(&[1, 2, 3])).as_bytes(),
            Some(&[1u8, 2, 3][..])
        );
        assert_eq!(
            Reply::SimpleString("OK".into()).as_bytes(),
            Some(b"OK".as_ref())
        );
        assert_eq!(Reply::Integer(1).as_bytes(), None);
    }

    #[test]
    fn numeric_accessors() {
        assert_eq!(Reply::Integer(-7).as_int(), Some(-7));
        assert_eq!(Reply::Double(3.5).as_f64(), Some(3.5));
        assert_eq!(Reply::Integer(2).as_f64(), Some(2.0));
        assert_eq!(Reply::SimpleString("42".into()).as_int(), None);
    }

    #[test]
    fn into_array_and_map() {
        let v = Reply::Array(vec![Reply::Integer(1), Reply::Integer(2)]);
        assert_eq!(v.into_array().unwrap().len(), 2);
        assert!(Reply::Integer(1).into_array().is_none());

        let m = Reply::Map(vec![(Reply::SimpleString("k".into()), Reply::Integer(1))]);
        assert_eq!(m.into_map().unwrap().len(), 1);
        assert!(Reply::Null.into_map().is_none());
    }

    #[test]
    fn null_and_ok_predicates() {
        assert!(Reply::Null.is_null());
        assert!(!Reply::Integer(0).is_null());
        assert!(Reply::SimpleString("OK".into()).is_ok());
        assert!(!Reply::SimpleString("QUEUED".into()).is_ok());
        assert!(!Reply::BulkString(Bytes::from_static(b"OK")).is_ok());
    }

    #[test]
    fn error_predicates() {
        assert!(Reply::Error("ERR x".into()).is_error());
        assert!(Reply::BulkError("SYNTAX y".into()).is_error());
        assert!(!Reply::SimpleString("ERR".into()).is_error());
        assert_eq!(Reply::Error("ERR x".into()).error_message(), Some("ERR x"));
        assert_eq!(Reply::Integer(1).error_message(), None);
    }

    #[test]
    fn push_predicate() {
        let p = Reply::Push {
            kind: "invalidate".into(),
            data: vec![],
        };
        assert!(p.is_push());
        assert!(!Reply::Array(vec![]).is_push());
    }

    #[test]
    fn type_names() {
        assert_eq!(Reply::Null.type_name(), "null");
        assert_eq!(Reply::Map(vec![]).type_name(), "map");
        assert_eq!(
            Reply::Attribute {
                data: Box::new(Reply::Null),
                attrs: vec![]
            }
            .type_name(),
            "attribute"
        );
    }
}
