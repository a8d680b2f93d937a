//! Byte channel to storage nodes
//!
//! Storage nodes need nothing beyond method + URL + raw body, so this speaks
//! the minimal HTTP/1.1 subset directly over a `TcpStream`: a chunked PUT
//! for uploads (the byte count is unknown until close) and a GET whose body
//! is Content-Length bounded or close-delimited.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use crate::addr::DevUrl;
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("mogile/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy)]
pub struct StorageOptions {
    pub sock_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

fn connect(url: &DevUrl, opts: &StorageOptions) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for sa in (url.host.as_str(), url.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&sa, opts.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                stream.set_read_timeout(opts.sock_timeout)?;
                stream.set_write_timeout(opts.sock_timeout)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no resolved address")
    }))
}

struct ResponseHead {
    status: u16,
    content_length: Option<u64>,
    chunked: bool,
}

fn read_head<R: BufRead>(r: &mut R) -> std::io::Result<ResponseHead> {
    let bad = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());
    let mut status_line = String::new();
    if r.read_line(&mut status_line)? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "storage node closed before responding",
        ));
    }
    let mut parts = status_line.split_whitespace();
    let version = parts.next().ok_or_else(|| bad("empty status line"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(bad("not an HTTP response"));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad("bad status code"))?;

    let mut content_length = None;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        if r.read_line(&mut line)? == 0 {
            return Err(bad("truncated response headers"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.trim().eq_ignore_ascii_case("chunked");
            }
        }
    }
    Ok(ResponseHead {
        status,
        content_length,
        chunked,
    })
}

/// Chunked PUT in progress. Bytes go out as they are written; `finish`
/// terminates the body and checks the storage node's verdict.
pub struct PutStream {
    stream: TcpStream,
    url: DevUrl,
}

impl PutStream {
    /// Connect and send the request head. A failure here is a connect-time
    /// failure: the caller may fail over to the next replica destination.
    pub fn open(url: &DevUrl, opts: &StorageOptions) -> std::io::Result<PutStream> {
        let mut stream = connect(url, opts)?;
        let head = format!(
            "PUT {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            url.path, url.host, url.port, USER_AGENT
        );
        stream.write_all(head.as_bytes())?;
        debug!(url = %url, "storage PUT opened");
        Ok(PutStream {
            stream,
            url: url.clone(),
        })
    }

    /// Terminate the chunked body and read the response. Consumes the stream;
    /// after this no more bytes can be written.
    pub fn finish(mut self) -> Result<()> {
        self.stream.write_all(b"0\r\n\r\n")?;
        self.stream.flush()?;
        let mut reader = BufReader::new(&self.stream);
        let head = read_head(&mut reader)?;
        if !(200..300).contains(&head.status) {
            return Err(Error::BadResponse(format!(
                "storage node returned {} for PUT {}",
                head.status, self.url
            )));
        }
        Ok(())
    }
}

impl Write for PutStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // One chunk per write call; the uploader batches via BufWriter.
        write!(self.stream, "{:x}\r\n", buf.len())?;
        self.stream.write_all(buf)?;
        self.stream.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

/// How the storage node framed the GET body.
enum BodyFraming {
    /// Content-Length bounded; the count is bytes left to read.
    Length(u64),
    /// Transfer-Encoding: chunked; framing is stripped before the caller
    /// sees any bytes.
    Chunked { in_chunk: u64, done: bool },
    /// No framing header; body runs until the node closes the socket.
    UntilClose,
}

/// Body of a successful GET. Forward-only; dropping it closes the socket.
pub struct GetStream {
    reader: BufReader<TcpStream>,
    body: BodyFraming,
}

impl GetStream {
    /// Connect, send the request, and consume the response head. Any failure
    /// (connect, timeout, non-2xx) lets the caller try the next replica.
    pub fn open(url: &DevUrl, opts: &StorageOptions) -> std::io::Result<GetStream> {
        let mut stream = connect(url, opts)?;
        let head = format!(
            "GET {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: {}\r\nConnection: close\r\n\r\n",
            url.path, url.host, url.port, USER_AGENT
        );
        stream.write_all(head.as_bytes())?;
        let mut reader = BufReader::new(stream);
        let resp = read_head(&mut reader)?;
        if !(200..300).contains(&resp.status) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("storage node returned {} for GET {}", resp.status, url),
            ));
        }
        debug!(url = %url, len = ?resp.content_length, chunked = resp.chunked, "storage GET opened");
        let body = if resp.chunked {
            BodyFraming::Chunked {
                in_chunk: 0,
                done: false,
            }
        } else {
            match resp.content_length {
                Some(len) => BodyFraming::Length(len),
                None => BodyFraming::UntilClose,
            }
        };
        Ok(GetStream { reader, body })
    }

    /// Bytes left to read per Content-Length, when the node sent one.
    pub fn len(&self) -> Option<u64> {
        match self.body {
            BodyFraming::Length(left) => Some(left),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    fn read_chunked(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let BodyFraming::Chunked { in_chunk, done } = &mut self.body else {
            unreachable!("read_chunked on non-chunked body");
        };
        if *done {
            return Ok(0);
        }
        if *in_chunk == 0 {
            let mut size_line = String::new();
            if self.reader.read_line(&mut size_line)? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "storage node closed mid chunked body",
                ));
            }
            let size_str = size_line.trim().split(';').next().unwrap_or("");
            let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad chunk size line {:?}", size_line),
                )
            })?;
            if size == 0 {
                // Trailer section: skip lines through the blank terminator.
                loop {
                    let mut trailer = String::new();
                    if self.reader.read_line(&mut trailer)? == 0 {
                        break;
                    }
                    if trailer == "\r\n" || trailer == "\n" {
                        break;
                    }
                }
                *done = true;
                return Ok(0);
            }
            *in_chunk = size;
        }
        let cap = buf.len().min((*in_chunk).min(usize::MAX as u64) as usize);
        let n = self.reader.read(&mut buf[..cap])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "storage node closed inside a chunk",
            ));
        }
        *in_chunk -= n as u64;
        if *in_chunk == 0 {
            let mut crlf = [0u8; 2];
            self.reader.read_exact(&mut crlf)?;
        }
        Ok(n)
    }
}

impl Read for GetStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.body {
            BodyFraming::Length(0) => Ok(0),
            BodyFraming::Length(left) => {
                let cap = buf.len().min(left.min(usize::MAX as u64) as usize);
                let n = self.reader.read(&mut buf[..cap])?;
                if n == 0 && left > 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("storage node closed with {} bytes left", left),
                    ));
                }
                self.body = BodyFraming::Length(left - n as u64);
                Ok(n)
            }
            BodyFraming::Chunked { .. } => self.read_chunked(buf),
            BodyFraming::UntilClose => self.reader.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn opts() -> StorageOptions {
        StorageOptions {
            sock_timeout: Some(Duration::from_secs(2)),
            connect_timeout: Duration::from_millis(500),
        }
    }

    fn url_for(port: u16, path: &str) -> DevUrl {
        DevUrl::parse(&format!("http://127.0.0.1:{}{}", port, path)).unwrap()
    }

    /// Serve one GET with the given body, then exit.
    fn one_shot_get_server(body: Vec<u8>, with_length: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let head = if with_length {
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len())
            } else {
                "HTTP/1.1 200 OK\r\n\r\n".to_string()
            };
            conn.write_all(head.as_bytes()).unwrap();
            conn.write_all(&body).unwrap();
        });
        port
    }

    /// Accept one PUT, decode the chunked body, respond 201, and hand the
    /// received bytes back.
    fn one_shot_put_server() -> (u16, std::sync::mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let mut body = Vec::new();
            loop {
                let mut size_line = String::new();
                reader.read_line(&mut size_line).unwrap();
                let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
                if size == 0 {
                    let mut crlf = String::new();
                    reader.read_line(&mut crlf).unwrap();
                    break;
                }
                let mut chunk = vec![0u8; size + 2];
                reader.read_exact(&mut chunk).unwrap();
                chunk.truncate(size);
                body.extend_from_slice(&chunk);
            }
            conn.write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            tx.send(body).unwrap();
        });
        (port, rx)
    }

    #[test]
    fn put_round_trips_chunked_body() {
        let (port, rx) = one_shot_put_server();
        let mut put = PutStream::open(&url_for(port, "/dev1/1.fid"), &opts()).unwrap();
        put.write_all(b"hello ").unwrap();
        put.write_all(b"storage").unwrap();
        put.finish().unwrap();
        assert_eq!(rx.recv().unwrap(), b"hello storage");
    }

    #[test]
    fn get_honors_content_length() {
        let port = one_shot_get_server(b"0123456789".to_vec(), true);
        let mut get = GetStream::open(&url_for(port, "/dev1/1.fid"), &opts()).unwrap();
        assert_eq!(get.len(), Some(10));
        let mut out = Vec::new();
        get.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
    }

    /// Serve one GET whose body uses chunked transfer encoding.
    fn one_shot_chunked_get_server(raw_body: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .unwrap();
            conn.write_all(raw_body).unwrap();
        });
        port
    }

    #[test]
    fn get_decodes_chunked_body() {
        let port = one_shot_chunked_get_server(b"3\r\nabc\r\n0\r\n\r\n");
        let mut get = GetStream::open(&url_for(port, "/dev1/1.fid"), &opts()).unwrap();
        assert_eq!(get.len(), None);
        let mut out = Vec::new();
        get.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn get_decodes_multi_chunk_body() {
        let port = one_shot_chunked_get_server(b"5\r\nhello\r\n8\r\n storage\r\n0\r\n\r\n");
        let mut get = GetStream::open(&url_for(port, "/dev1/2.fid"), &opts()).unwrap();
        let mut out = Vec::new();
        get.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello storage");
    }

    #[test]
    fn get_rejects_garbled_chunk_framing() {
        let port = one_shot_chunked_get_server(b"nothex\r\nabc\r\n0\r\n\r\n");
        let mut get = GetStream::open(&url_for(port, "/dev1/3.fid"), &opts()).unwrap();
        let mut out = Vec::new();
        assert!(get.read_to_end(&mut out).is_err());
    }

    #[test]
    fn get_reads_close_delimited_body() {
        let port = one_shot_get_server(b"abc".to_vec(), false);
        let mut get = GetStream::open(&url_for(port, "/f"), &opts()).unwrap();
        let mut out = Vec::new();
        get.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn get_rejects_http_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            conn.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });
        assert!(GetStream::open(&url_for(port, "/missing"), &opts()).is_err());
    }

    #[test]
    fn connect_refused_is_io_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(PutStream::open(&url_for(port, "/x"), &opts()).is_err());
    }
}
