//! Stateless codec for the tracker's line-oriented key=value protocol
//!
//! Requests are `cmd arg=val&arg=val\r\n` with percent-encoded values.
//! Responses are a single `OK <args>\r\n` or `ERR <code> <message>\r\n` line.

use std::collections::HashMap;

use crate::addr::DevUrl;
use crate::error::{Error, Result};

/// Encode one request line. Values are percent-encoded; keys are plain ASCII
/// controlled by this crate.
pub fn encode_request(cmd: &str, args: &[(&str, &str)]) -> String {
    let mut line = String::with_capacity(cmd.len() + 32 * args.len());
    line.push_str(cmd);
    for (i, (k, v)) in args.iter().enumerate() {
        line.push(if i == 0 { ' ' } else { '&' });
        line.push_str(k);
        line.push('=');
        line.push_str(&urlencoding::encode(v));
    }
    line.push_str("\r\n");
    line
}

/// Decode one response line into its argument map. `ERR` lines become
/// `Error::Protocol` with the code and decoded message preserved.
pub fn decode_response(line: &str) -> Result<HashMap<String, String>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix("OK") {
        return parse_args(rest.trim_start());
    }
    if let Some(rest) = line.strip_prefix("ERR") {
        let rest = rest.trim_start();
        let (code, msg) = rest.split_once(' ').unwrap_or((rest, ""));
        let message = urlencoding::decode(msg)
            .map(|m| m.into_owned())
            .unwrap_or_else(|_| msg.to_string());
        if code.is_empty() {
            return Err(Error::BadResponse("ERR line without code".into()));
        }
        return Err(Error::protocol(code, message));
    }
    Err(Error::BadResponse(format!("unrecognized response: {:?}", line)))
}

fn parse_args(s: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    if s.is_empty() {
        return Ok(map);
    }
    for pair in s.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let v = urlencoding::decode(v)
            .map_err(|_| Error::BadResponse(format!("bad escape in arg {:?}", pair)))?;
        map.insert(k.to_string(), v.into_owned());
    }
    Ok(map)
}

/// One write destination from `create_open`: where to PUT and which device
/// to name in `create_close`.
#[derive(Debug, Clone)]
pub struct CreateDest {
    pub devid: u64,
    pub url: DevUrl,
}

/// Result of `create_open`: the fid is the commit token, the dests are the
/// tracker's ranked write locations.
#[derive(Debug, Clone)]
pub struct CreateResolution {
    pub fid: u64,
    pub dests: Vec<CreateDest>,
}

pub fn create_open(domain: &str, key: &str, class: &str) -> String {
    encode_request(
        "create_open",
        &[
            ("domain", domain),
            ("key", key),
            ("class", class),
            ("multi_dest", "1"),
        ],
    )
}

/// Decode a create_open reply. Multi-dest trackers answer with
/// `dev_count=N&devid_1=..&path_1=..`; older single-dest trackers answer
/// with plain `devid=..&path=..`. Both are accepted.
pub fn decode_create_open(args: &HashMap<String, String>) -> Result<CreateResolution> {
    let fid = req_u64(args, "fid")?;
    let mut dests = Vec::new();
    if let Some(count) = args.get("dev_count") {
        let count: usize = count
            .parse()
            .map_err(|_| Error::BadResponse("bad dev_count".into()))?;
        for i in 1..=count {
            let devid = req_u64(args, &format!("devid_{}", i))?;
            let path = req_str(args, &format!("path_{}", i))?;
            dests.push(CreateDest {
                devid,
                url: DevUrl::parse(path)?,
            });
        }
    } else {
        dests.push(CreateDest {
            devid: req_u64(args, "devid")?,
            url: DevUrl::parse(req_str(args, "path")?)?,
        });
    }
    if dests.is_empty() {
        return Err(Error::BadResponse("create_open returned no destinations".into()));
    }
    Ok(CreateResolution { fid, dests })
}

pub fn create_close(
    domain: &str,
    key: &str,
    fid: u64,
    devid: u64,
    path: &str,
    size: u64,
) -> String {
    encode_request(
        "create_close",
        &[
            ("domain", domain),
            ("key", key),
            ("fid", &fid.to_string()),
            ("devid", &devid.to_string()),
            ("path", path),
            ("size", &size.to_string()),
        ],
    )
}

pub fn get_paths(domain: &str, key: &str) -> String {
    encode_request("get_paths", &[("domain", domain), ("key", key)])
}

/// Decode a get_paths reply: `paths=N&path1=..&path2=..`. Note the bare
/// `pathN` keys, unlike create_open's `path_N`.
pub fn decode_get_paths(args: &HashMap<String, String>) -> Result<Vec<DevUrl>> {
    let count: usize = match args.get("paths") {
        Some(n) => n
            .parse()
            .map_err(|_| Error::BadResponse("bad paths count".into()))?,
        None => 0,
    };
    let mut paths = Vec::with_capacity(count);
    for i in 1..=count {
        paths.push(DevUrl::parse(req_str(args, &format!("path{}", i))?)?);
    }
    Ok(paths)
}

pub fn delete(domain: &str, key: &str) -> String {
    encode_request("delete", &[("domain", domain), ("key", key)])
}

pub fn rename(domain: &str, from_key: &str, to_key: &str) -> String {
    encode_request(
        "rename",
        &[("domain", domain), ("from_key", from_key), ("to_key", to_key)],
    )
}

fn req_str<'a>(args: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    args.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| Error::BadResponse(format!("missing field {:?}", key)))
}

fn req_u64(args: &HashMap<String, String>, key: &str) -> Result<u64> {
    req_str(args, key)?
        .parse()
        .map_err(|_| Error::BadResponse(format!("non-numeric field {:?}", key)))
}
