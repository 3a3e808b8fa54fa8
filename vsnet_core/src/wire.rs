//! Little-endian wire encoding shared by every protocol layer.
//!
//! Layouts:
//! - Element header: `id: u64 | prefab: u8 | timestamp: i32` (13 bytes)
//! - Node data: `device: u8 | haptics_channel: u8 | mocap: u8 | battery: u32 | synced_ts: i32` (11 bytes)

use crate::error::WireError;
use vsnet_env::Timestamp;

/// Size of an encoded [`Header`].
pub const HEADER_SIZE: usize = 13;

/// Size of an encoded [`NodeData`].
pub const NODE_DATA_SIZE: usize = 11;

/// Cursor over a received payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or(WireError::Undersized {
            needed: end,
            got: self.buf.len(),
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        self.take().map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.take().map(i32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.take().map(u64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        self.take().map(f32::from_le_bytes)
    }

    /// Returns the unread tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }
}

/// Append-only builder for an outgoing payload.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Identity and time stamp prefixed to every element update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u64,
    pub prefab: u8,
    pub timestamp: Timestamp,
}

impl Header {
    pub fn write(&self, out: &mut WireWriter) {
        out.put_u64(self.id).put_u8(self.prefab).put_i32(self.timestamp);
    }

    /// Encodes the header followed by `payload`.
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = WireWriter::with_capacity(HEADER_SIZE + payload.len());
        self.write(&mut out);
        out.put_bytes(payload);
        out.into_bytes()
    }

    /// Splits an update into its header and element payload.
    pub fn split(bytes: &[u8]) -> Result<(Header, &[u8]), WireError> {
        let mut reader = WireReader::new(bytes);
        let header = Header {
            id: reader.read_u64()?,
            prefab: reader.read_u8()?,
            timestamp: reader.read_i32()?,
        };
        Ok((header, reader.rest()))
    }
}

/// Metadata a device advertises in reply to a discovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeData {
    pub device_id: u8,
    pub haptics_channel: u8,
    pub mocap_available: bool,
    pub battery_level: u32,
    /// Timestamp our clock was last restarted to, `i32::MAX` if never
    pub synchronized_timestamp: Timestamp,
}

impl NodeData {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = WireWriter::with_capacity(NODE_DATA_SIZE);
        out.put_u8(self.device_id)
            .put_u8(self.haptics_channel)
            .put_u8(u8::from(self.mocap_available))
            .put_u32(self.battery_level)
            .put_i32(self.synchronized_timestamp);
        out.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        Ok(Self {
            device_id: reader.read_u8()?,
            haptics_channel: reader.read_u8()?,
            mocap_available: reader.read_u8()? != 0,
            battery_level: reader.read_u32()?,
            synchronized_timestamp: reader.read_i32()?,
        })
    }
}

/// Encodes a bare timestamp payload (`SyncClock`, `AckSyncClock`).
pub fn encode_timestamp(ts: Timestamp) -> Vec<u8> {
    ts.to_le_bytes().to_vec()
}

pub fn decode_timestamp(bytes: &[u8]) -> Result<Timestamp, WireError> {
    WireReader::new(bytes).read_i32()
}
