//! Length-prefixed variable-int framing for persisted configuration.
//!
//! Frame primitives (all values 32-bit unsigned):
//!
//! ```text
//! int:    7-bit chunks, highest chunk first; every byte except the last
//!         has the high bit set; leading 0x80 bytes are stripped
//! string: int(len) || bytes
//! map:    int(entries) || (string(key) || string(value))^entries
//! ```
//!
//! Top-level map values are themselves serialized [`ConfigVar`] blobs, so
//! the framing nests.

use std::collections::BTreeMap;

use tracing::warn;

/// A growable byte buffer with a read/write cursor.
#[derive(Debug, Clone, Default)]
pub struct ConfigVar {
    buffer: Vec<u8>,
    offset: usize,
}

impl ConfigVar {
    pub fn new() -> Self {
        ConfigVar::default()
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        ConfigVar {
            buffer: buf.to_vec(),
            offset: 0,
        }
    }

    pub fn reset_offset(&mut self) {
        self.offset = 0;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn at(&self) -> usize {
        self.offset
    }

    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let avail = self.buffer.len().saturating_sub(self.offset);
        let to_copy = out.len().min(avail);
        out[..to_copy].copy_from_slice(&self.buffer[self.offset..self.offset + to_copy]);
        self.offset += to_copy;
        to_copy
    }

    pub fn write(&mut self, data: &[u8]) {
        if self.offset == self.buffer.len() {
            self.buffer.extend_from_slice(data);
        } else {
            let end = (self.offset + data.len()).min(self.buffer.len());
            let overlap = end - self.offset;
            self.buffer[self.offset..end].copy_from_slice(&data[..overlap]);
            self.buffer.extend_from_slice(&data[overlap..]);
        }
        self.offset += data.len();
    }

    /// Emit `val` as a 7-bit varint, highest chunk first.
    pub fn write_int(&mut self, val: u32) {
        let digits = [
            0x80 | ((val >> 28) & 0x0f) as u8,
            0x80 | ((val >> 21) & 0x7f) as u8,
            0x80 | ((val >> 14) & 0x7f) as u8,
            0x80 | ((val >> 7) & 0x7f) as u8,
            (val & 0x7f) as u8,
        ];

        let mut start = 0;
        while digits[start] == 0x80 {
            start += 1;
        }
        self.write(&digits[start..]);
    }

    pub fn read_int(&mut self) -> Option<u32> {
        let mut value: u64 = 0;
        let mut read_any = false;
        loop {
            let byte = *self.buffer.get(self.offset)?;
            self.offset += 1;
            read_any = true;
            value = ((value << 7) | u64::from(byte & 0x7f)) & 0xffff_ffff;
            if byte & 0x80 == 0 {
                break;
            }
            if self.offset >= self.buffer.len() {
                break;
            }
        }
        read_any.then_some(value as u32)
    }

    /// Read an int, falling back to `default` when the buffer is
    /// exhausted. Lets newer readers consume older frames with trailing
    /// fields absent.
    pub fn read_int_default(&mut self, default: u32) -> u32 {
        if self.offset >= self.buffer.len() {
            return default;
        }
        self.read_int().unwrap_or(default)
    }

    pub fn read_bool_default(&mut self, default: bool) -> bool {
        self.read_int_default(u32::from(default)) != 0
    }

    pub fn write_bool(&mut self, val: bool) {
        self.write_int(u32::from(val));
    }

    pub fn write_string(&mut self, s: &[u8]) {
        self.write_int(s.len() as u32);
        self.write(s);
    }

    pub fn read_string(&mut self) -> Option<Vec<u8>> {
        let len = self.read_int()? as usize;
        let mut out = vec![0u8; len];
        let got = self.read(&mut out);
        if got != len {
            warn!(expected = len, got, "string frame shorter than its length prefix");
            return None;
        }
        Some(out)
    }
}

/// The persisted key/value map: each value is a nested [`ConfigVar`] blob.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    vars: BTreeMap<String, ConfigVar>,
}

impl ConfigMap {
    pub fn new() -> Self {
        ConfigMap::default()
    }

    pub fn get(&self, key: &str) -> Option<ConfigVar> {
        self.vars.get(key).cloned()
    }

    pub fn insert(&mut self, key: &str, value: ConfigVar) {
        self.vars.insert(key.to_owned(), value);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn to_var(&self) -> ConfigVar {
        let mut out = ConfigVar::new();
        out.write_int(self.vars.len() as u32);
        for (key, value) in &self.vars {
            out.write_string(key.as_bytes());
            out.write_string(value.buffer());
        }
        out
    }

    pub fn from_var(input: &mut ConfigVar) -> Option<Self> {
        input.reset_offset();

        let entries = input.read_int()?;
        let mut vars = BTreeMap::new();
        for _ in 0..entries {
            let key = input.read_string()?;
            let value = input.read_string()?;
            if key.is_empty() {
                warn!("invalid empty key in config frame");
                return None;
            }
            let key = String::from_utf8(key).ok()?;
            vars.insert(key, ConfigVar::from_bytes(&value));
        }
        Some(ConfigMap { vars })
    }
}
