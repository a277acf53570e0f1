//! RESP command frame encoder.
//!
//! Commands go on the wire as an array of bulk strings:
//! `*<N>\r\n$<len>\r\narg1\r\n$<len>\r\narg2\r\n…`
//! Every argument is emitted as raw bytes; numeric rendering happens at
//! the call site before the codec sees the argument.

use itoa::Buffer;

/// Encode one command (ordered argument list) into wire format.
///
/// # Example
/// ```ignore
/// let frame = encode_command(&["SET", "key", "value"]);
/// // → *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n
/// ```
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame_capacity(args));
    append_command(&mut buf, args);
    buf
}

/// Encode many commands into one contiguous buffer for a pipelined write.
///
/// One allocation, one `write_all` — avoids N syscalls for N commands.
pub fn encode_pipeline<A: AsRef<[u8]>>(commands: &[Vec<A>]) -> Vec<u8> {
    let cap = commands.iter().map(|c| frame_capacity(c)).sum();
    let mut buf = Vec::with_capacity(cap);
    for args in commands {
        append_command(&mut buf, args);
    }
    buf
}

fn frame_capacity<A: AsRef<[u8]>>(args: &[A]) -> usize {
    // '*' + max_digits + \r\n, then '$' + max_digits + \r\n + data + \r\n per arg
    let mut cap = 1 + 10 + 2;
    for arg in args {
        cap += 1 + 10 + 2 + arg.as_ref().len() + 2;
    }
    cap
}

fn append_command<A: AsRef<[u8]>>(buf: &mut Vec<u8>, args: &[A]) {
    let mut digits = Buffer::new();

    buf.push(b'*');
    buf.extend_from_slice(digits.format(args.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");

    for arg in args {
        let arg = arg.as_ref();
        buf.push(b'$');
        buf.extend_from_slice(digits.format(arg.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Build a command argument vector (`Vec<Vec<u8>>`) ergonomically.
///
/// Usage:
/// ```ignore
/// let args = cmd!("SET", key, "1");
/// ```
#[macro_export]
macro_rules! cmd {
    ($($arg:expr),+ $(,)?) => {{
        vec![$($arg.as_bytes().to_vec()),+]
    }};
}

// ── Tests ──────────────────────────────────────────────────────────
