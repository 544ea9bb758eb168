use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{Error, ErrorKind, Result};

/// terminates service name, method and every meta entry.
pub const SPLITTER: u8 = b'\n';
/// separates key from value inside one meta entry.
pub const PAIR_SPLITTER: u8 = b'\r';

/// head length, body length, message id, version, compressor, serializer.
pub const FIXED_HEAD_LENGTH: usize = 15;
/// head length and body length, the part of a frame read before its size is known.
pub const LENGTH_PREFIX: usize = 8;

pub const META_DEADLINE: &str = "deadline";
pub const META_ONEWAY: &str = "one-way";
pub const META_GROUP: &str = "group";

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString, Primitive)]
#[allow(clippy::upper_case_acronyms)]
pub enum SerializeType {
    SerializeNone = 0,
    JSON = 1,
    ProtoBuffer = 2,
    MsgPack = 3,
}

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq, EnumIter, EnumString, Primitive)]
pub enum CompressType {
    CompressNone = 0,
    Gzip = 1,
}

pub type Metadata = BTreeMap<String, String>;

/// common header accessors of request and response frames.
pub trait MrpcMessage: Sized {
    fn get_message_id(&self) -> u32;
    fn get_version(&self) -> u8;
    fn get_compressor(&self) -> u8;
    fn get_serializer(&self) -> u8;
    /// refreshes `head_length` and `body_length` from the current fields.
    fn set_head_length(&mut self);
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(bs: &[u8]) -> Result<Self>;

    fn get_serialize_type(&self) -> Option<SerializeType> {
        SerializeType::from_u8(self.get_serializer())
    }
    fn get_compress_type(&self) -> Option<CompressType> {
        CompressType::from_u8(self.get_compressor())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub head_length: u32,
    pub body_length: u32,
    pub message_id: u32,
    pub version: u8,
    pub compressor: u8,
    pub serializer: u8,
    pub service_name: String,
    pub method: String,
    pub meta: Metadata,
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(service_name: &str, method: &str) -> Request {
        let mut req = Request {
            service_name: service_name.to_owned(),
            method: method.to_owned(),
            ..Default::default()
        };
        req.set_head_length();
        req
    }

    pub fn with_message_id(mut self, message_id: u32) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_codes(mut self, st: SerializeType, ct: CompressType) -> Self {
        self.serializer = st as u8;
        self.compressor = ct as u8;
        self
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_owned(), value.to_owned());
        self.set_head_length();
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self.set_head_length();
        self
    }

    pub fn is_oneway(&self) -> bool {
        self.meta.get(META_ONEWAY).map(String::as_str) == Some("true")
    }

    /// the absolute deadline carried in meta, if any.
    pub fn deadline(&self) -> Option<SystemTime> {
        let millis: u64 = self.meta.get(META_DEADLINE)?.parse().ok()?;
        UNIX_EPOCH.checked_add(Duration::from_millis(millis))
    }

    pub fn set_deadline(&mut self, deadline: SystemTime) {
        let millis = deadline
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        self.meta
            .insert(META_DEADLINE.to_owned(), millis.to_string());
        self.set_head_length();
    }

    fn check_fields(&self) -> Result<()> {
        check_field("service name", &self.service_name)?;
        check_field("method", &self.method)?;
        for (k, v) in &self.meta {
            check_field("meta key", k)?;
            check_field("meta value", v)?;
        }
        Ok(())
    }

    fn computed_head_length(&self) -> usize {
        let mut len = FIXED_HEAD_LENGTH;
        len += self.service_name.len() + 1;
        len += self.method.len() + 1;
        for (k, v) in &self.meta {
            len += k.len() + 1 + v.len() + 1;
        }
        len
    }
}

impl MrpcMessage for Request {
    fn get_message_id(&self) -> u32 {
        self.message_id
    }
    fn get_version(&self) -> u8 {
        self.version
    }
    fn get_compressor(&self) -> u8 {
        self.compressor
    }
    fn get_serializer(&self) -> u8 {
        self.serializer
    }

    fn set_head_length(&mut self) {
        self.head_length = self.computed_head_length() as u32;
        self.body_length = self.data.len() as u32;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        self.check_fields()?;
        let head_length = self.computed_head_length();
        let (head, body) = frame_lengths(head_length, self.data.len())?;

        let mut buf = BytesMut::with_capacity(head_length + self.data.len());
        put_fixed_head(&mut buf, head, body, self);

        buf.put_slice(self.service_name.as_bytes());
        buf.put_u8(SPLITTER);
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(SPLITTER);
        for (k, v) in &self.meta {
            buf.put_slice(k.as_bytes());
            buf.put_u8(PAIR_SPLITTER);
            buf.put_slice(v.as_bytes());
            buf.put_u8(SPLITTER);
        }
        buf.put_slice(&self.data);
        Ok(buf.to_vec())
    }

    fn decode(bs: &[u8]) -> Result<Request> {
        let (head_length, body_length) = read_lengths(bs)?;
        let mut req = Request {
            head_length: head_length as u32,
            body_length: body_length as u32,
            message_id: BigEndian::read_u32(&bs[8..12]),
            version: bs[12],
            compressor: bs[13],
            serializer: bs[14],
            ..Default::default()
        };

        let mut header = &bs[FIXED_HEAD_LENGTH..head_length];
        let (service_name, rest) = split_field(header, "service name")?;
        req.service_name = service_name;
        header = rest;
        let (method, rest) = split_field(header, "method")?;
        req.method = method;
        header = rest;

        while !header.is_empty() {
            let end = position(header, SPLITTER)
                .ok_or_else(|| Error::new(ErrorKind::Protocol, "unterminated meta entry"))?;
            let pair = &header[..end];
            let idx = position(pair, PAIR_SPLITTER)
                .ok_or_else(|| Error::new(ErrorKind::Protocol, "meta entry without value"))?;
            let key = read_str(&pair[..idx])?;
            let value = read_str(&pair[idx + 1..])?;
            if req.meta.insert(key.clone(), value).is_some() {
                return Err(Error::new(
                    ErrorKind::Protocol,
                    format!("duplicated meta key {}", key),
                ));
            }
            header = &header[end + 1..];
        }

        req.data = bs[head_length..].to_vec();
        Ok(req)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub head_length: u32,
    pub body_length: u32,
    pub message_id: u32,
    pub version: u8,
    pub compressor: u8,
    pub serializer: u8,
    pub error: Vec<u8>,
    pub data: Vec<u8>,
}

impl Response {
    /// an empty response answering `req`, with the same id and codes.
    pub fn reply_to(req: &Request) -> Response {
        let mut resp = Response {
            message_id: req.message_id,
            version: req.version,
            compressor: req.compressor,
            serializer: req.serializer,
            ..Default::default()
        };
        resp.set_head_length();
        resp
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = err.as_bytes().to_vec();
        self.set_head_length();
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self.set_head_length();
        self
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn error_message(&self) -> Option<String> {
        if self.error.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.error).into_owned())
        }
    }
}

impl MrpcMessage for Response {
    fn get_message_id(&self) -> u32 {
        self.message_id
    }
    fn get_version(&self) -> u8 {
        self.version
    }
    fn get_compressor(&self) -> u8 {
        self.compressor
    }
    fn get_serializer(&self) -> u8 {
        self.serializer
    }

    fn set_head_length(&mut self) {
        self.head_length = (FIXED_HEAD_LENGTH + self.error.len()) as u32;
        self.body_length = self.data.len() as u32;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let head_length = FIXED_HEAD_LENGTH + self.error.len();
        let (head, body) = frame_lengths(head_length, self.data.len())?;

        let mut buf = BytesMut::with_capacity(head_length + self.data.len());
        put_fixed_head(&mut buf, head, body, self);
        buf.put_slice(&self.error);
        buf.put_slice(&self.data);
        Ok(buf.to_vec())
    }

    fn decode(bs: &[u8]) -> Result<Response> {
        let (head_length, body_length) = read_lengths(bs)?;
        Ok(Response {
            head_length: head_length as u32,
            body_length: body_length as u32,
            message_id: BigEndian::read_u32(&bs[8..12]),
            version: bs[12],
            compressor: bs[13],
            serializer: bs[14],
            error: bs[FIXED_HEAD_LENGTH..head_length].to_vec(),
            data: bs[head_length..].to_vec(),
        })
    }
}

fn put_fixed_head<M: MrpcMessage>(buf: &mut BytesMut, head: u32, body: u32, msg: &M) {
    buf.put_u32(head);
    buf.put_u32(body);
    buf.put_u32(msg.get_message_id());
    buf.put_u8(msg.get_version());
    buf.put_u8(msg.get_compressor());
    buf.put_u8(msg.get_serializer());
}

fn frame_lengths(head_length: usize, body_length: usize) -> Result<(u32, u32)> {
    let head = u32::try_from(head_length)
        .map_err(|_| Error::new(ErrorKind::Encode, "header too large"))?;
    let body = u32::try_from(body_length)
        .map_err(|_| Error::new(ErrorKind::Encode, "body too large"))?;
    Ok((head, body))
}

/// validates the fixed lengths of a complete frame and returns them.
fn read_lengths(bs: &[u8]) -> Result<(usize, usize)> {
    if bs.len() < FIXED_HEAD_LENGTH {
        return Err(Error::new(
            ErrorKind::Protocol,
            format!("frame of {} bytes is shorter than the fixed header", bs.len()),
        ));
    }
    let head_length = BigEndian::read_u32(&bs[..4]) as usize;
    let body_length = BigEndian::read_u32(&bs[4..8]) as usize;
    if head_length < FIXED_HEAD_LENGTH || head_length > bs.len() {
        return Err(Error::new(
            ErrorKind::Protocol,
            format!("invalid head length {} for frame of {} bytes", head_length, bs.len()),
        ));
    }
    if bs.len() - head_length != body_length {
        return Err(Error::new(
            ErrorKind::Protocol,
            format!(
                "body length {} does not match the {} bytes after the header",
                body_length,
                bs.len() - head_length
            ),
        ));
    }
    Ok((head_length, body_length))
}

fn check_field(name: &str, value: &str) -> Result<()> {
    if value.bytes().any(|b| b == SPLITTER || b == PAIR_SPLITTER) {
        return Err(Error::new(
            ErrorKind::Encode,
            format!("{} {:?} contains a separator byte", name, value),
        ));
    }
    Ok(())
}

fn split_field<'a>(buf: &'a [u8], name: &str) -> Result<(String, &'a [u8])> {
    let idx = position(buf, SPLITTER)
        .ok_or_else(|| Error::new(ErrorKind::Protocol, format!("unterminated {}", name)))?;
    Ok((read_str(&buf[..idx])?, &buf[idx + 1..]))
}

fn position(buf: &[u8], b: u8) -> Option<usize> {
    buf.iter().position(|x| *x == b)
}

fn read_str(buf: &[u8]) -> Result<String> {
    std::str::from_utf8(buf)
        .map(String::from)
        .map_err(|err| Error::new(ErrorKind::Protocol, err))
}
