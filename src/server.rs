//! TCP/IPv4 HTTP server mode.
//!
//! The accept loop forks a child process per connection. The child either
//! serves a static file or executes the compiled program with file
//! descriptor 3 bound to the accepted socket. A request is static iff the
//! request line begins with `GET `, the URL-decoded path contains no
//! `/../` segment, and the filename extension is on the allow list;
//! everything else is dynamic.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::path::PathBuf;

use anyhow::Context;

use crate::compile::{run_compiled, Compiled};

const REQUEST_CAP: usize = 2 * 1024 * 1024;

/// `[ip][:port]`, both parts optional; defaults are `0.0.0.0:8080`.
pub fn parse_addr(value: &str) -> anyhow::Result<SocketAddrV4> {
    let (ip, port) = match value.split_once(':') {
        Some((ip, port)) => (ip, port),
        None => (value, ""),
    };
    let ip: Ipv4Addr = if ip.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        ip.parse().context("invalid ipv4 address")?
    };
    let port: u16 = if port.is_empty() {
        8080
    } else {
        port.parse().context("invalid port")?
    };
    Ok(SocketAddrV4::new(ip, port))
}

/// How a request is handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    /// Path relative to the document root, plus the mime type.
    Static(PathBuf, &'static str),
    Dynamic,
}

pub fn classify(head: &str) -> Request {
    let Some(rest) = head.strip_prefix("GET ") else {
        return Request::Dynamic;
    };
    let url = rest.split_whitespace().next().unwrap_or("");
    let Some(decoded) = url_decode(url) else {
        return Request::Dynamic;
    };
    if decoded.contains("/../") {
        return Request::Dynamic;
    }
    let Some(mime) = mime_for(&decoded) else {
        return Request::Dynamic;
    };
    let relative = decoded.trim_start_matches('/').to_owned();
    Request::Static(PathBuf::from(relative), mime)
}

pub fn mime_for(path: &str) -> Option<&'static str> {
    let dot = path.rfind('.')?;
    let ext = path[dot + 1..].to_ascii_lowercase();
    Some(match ext.as_str() {
        "html" | "htm" => "text/html",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "ico" => "image/x-icon",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        _ => return None,
    })
}

pub fn url_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hi = (hex[0] as char).to_digit(16)?;
                let lo = (hex[1] as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

pub fn static_response(mime: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\nContent-Length: {}\nConnection: close\nContent-Type: {mime}\n\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Accept connections forever, forking a child per connection.
#[cfg(unix)]
pub fn serve(addr: SocketAddrV4, compiled: &Compiled) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    log::info!("ready to accept connections on {addr}");
    loop {
        let (mut stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("accept: {e}");
                continue;
            }
        };
        log::debug!("connection from {peer}");
        let mut buf = vec![0u8; REQUEST_CAP];
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("read: {e}");
                continue;
            }
        };
        buf.truncate(n);

        // Safety: fork is immediately followed by either a return in the
        // parent or an unconditional exit at the end of the child branch;
        // no locks are held across it.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            anyhow::bail!("fork failed");
        }
        if pid > 0 {
            // Parent: the child owns the connection now.
            continue;
        }
        let status = handle_connection(&mut stream, &buf, compiled);
        std::process::exit(status);
    }
}

#[cfg(unix)]
fn handle_connection(stream: &mut TcpStream, request: &[u8], compiled: &Compiled) -> i32 {
    let head = String::from_utf8_lossy(request);
    match classify(&head) {
        Request::Static(path, mime) => {
            let full = compiled.source_dir.join(path);
            match std::fs::read(&full) {
                Ok(body) => {
                    let response = static_response(mime, &body);
                    if let Err(e) = stream.write_all(&response) {
                        log::warn!("write: {e}");
                        return 1;
                    }
                    0
                }
                Err(e) => {
                    log::warn!("static {}: {e}", full.display());
                    1
                }
            }
        }
        Request::Dynamic => {
            // The compiled program sees the socket as file descriptor 3.
            use std::os::fd::AsRawFd;
            // Safety: duplicating onto a fixed descriptor number; the
            // child exits right after running the program.
            let rc = unsafe { libc::dup2(stream.as_raw_fd(), 3) };
            if rc < 0 {
                log::warn!("dup2 failed");
                return 1;
            }
            match run_compiled(compiled) {
                Ok(outcome) => outcome.exit as i32,
                Err(e) => {
                    log::warn!("dynamic request failed: {e}");
                    1
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_address_and_overrides() {
        assert_eq!(
            parse_addr("").unwrap(),
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080)
        );
        assert_eq!(
            parse_addr("127.0.0.1").unwrap(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080)
        );
        assert_eq!(
            parse_addr(":9000").unwrap(),
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9000)
        );
        assert_eq!(
            parse_addr("127.0.0.1:81").unwrap(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 81)
        );
        assert!(parse_addr("nope:81").is_err());
    }

    #[test]
    fn get_with_allowed_extension_is_static() {
        assert_eq!(
            classify("GET /index.html HTTP/1.1\r\n"),
            Request::Static(PathBuf::from("index.html"), "text/html")
        );
        assert_eq!(
            classify("GET /a/b/logo.PNG HTTP/1.1\r\n"),
            Request::Static(PathBuf::from("a/b/logo.PNG"), "image/png")
        );
    }

    #[test]
    fn everything_else_is_dynamic() {
        assert_eq!(classify("POST /index.html HTTP/1.1\r\n"), Request::Dynamic);
        assert_eq!(classify("GET /page HTTP/1.1\r\n"), Request::Dynamic);
        assert_eq!(classify("GET /app.cgi HTTP/1.1\r\n"), Request::Dynamic);
        assert_eq!(classify("garbage"), Request::Dynamic);
    }

    #[test]
    fn parent_escapes_are_dynamic() {
        assert_eq!(
            classify("GET /a/../secret.html HTTP/1.1\r\n"),
            Request::Dynamic
        );
        // Even when the traversal is URL-encoded.
        assert_eq!(
            classify("GET /a/%2e%2e/secret.html HTTP/1.1\r\n"),
            Request::Dynamic
        );
    }

    #[test]
    fn url_decoding_handles_percent_and_plus() {
        assert_eq!(url_decode("a%20b+c").unwrap(), "a b c");
        assert!(url_decode("bad%zz").is_none());
    }

    #[test]
    fn response_has_the_fixed_header_shape() {
        let r = static_response("text/html", b"<p>hi</p>");
        let text = String::from_utf8(r).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\nContent-Length: 9\n"));
        assert!(text.contains("Connection: close\nContent-Type: text/html\n\n"));
        assert!(text.ends_with("<p>hi</p>"));
    }
}
