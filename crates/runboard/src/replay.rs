//! Binary replay header.
//!
//! Layout (little-endian): `u32` magic, `u8` version, NUL-terminated map name,
//! map hash, player name and steam id, `f32` tick rate, `u32` run flags,
//! NUL-terminated run date (unix seconds), `u32` start and stop tick, `u8`
//! track and zone number. Anything after the header is the frame stream,
//! which is not inspected here.

use crate::types::RunFlags;

pub const REPLAY_MAGIC: u32 = 0x524D_4F4D;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("replay truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("replay field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayHeader {
    pub magic: u32,
    pub version: u8,
    pub map_name: String,
    pub map_hash: String,
    pub player_name: String,
    pub steam_id: String,
    pub tick_rate: f32,
    pub run_flags: u32,
    pub run_date: String,
    pub start_tick: u32,
    pub stop_tick: u32,
    pub track_num: u8,
    pub zone_num: u8,
}

impl ReplayHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ReplayError> {
        let mut r = Reader { bytes, pos: 0 };
        Ok(Self {
            magic: r.u32("magic")?,
            version: r.u8("version")?,
            map_name: r.cstr("map name")?,
            map_hash: r.cstr("map hash")?,
            player_name: r.cstr("player name")?,
            steam_id: r.cstr("steam id")?,
            tick_rate: f32::from_bits(r.u32("tick rate")?),
            run_flags: r.u32("run flags")?,
            run_date: r.cstr("run date")?,
            start_tick: r.u32("start tick")?,
            stop_tick: r.u32("stop tick")?,
            track_num: r.u8("track number")?,
            zone_num: r.u8("zone number")?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.map_name.len() + self.player_name.len());
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.push(self.version);
        for s in [
            &self.map_name,
            &self.map_hash,
            &self.player_name,
            &self.steam_id,
        ] {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&self.tick_rate.to_bits().to_le_bytes());
        out.extend_from_slice(&self.run_flags.to_le_bytes());
        out.extend_from_slice(self.run_date.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.start_tick.to_le_bytes());
        out.extend_from_slice(&self.stop_tick.to_le_bytes());
        out.push(self.track_num);
        out.push(self.zone_num);
        out
    }

    /// Ticks between start and stop, `None` if stop precedes start.
    pub fn ticks(&self) -> Option<u32> {
        self.stop_tick.checked_sub(self.start_tick)
    }

    pub fn flags(&self) -> RunFlags {
        RunFlags::from_bits_retain(self.run_flags)
    }

    /// Run date as unix seconds, if it parses.
    pub fn run_date_secs(&self) -> Option<i64> {
        self.run_date.trim().parse().ok()
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize, field: &'static str) -> Result<&[u8], ReplayError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ReplayError::Truncated { field })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ReplayError> {
        Ok(self.take(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ReplayError> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self, field: &'static str) -> Result<String, ReplayError> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(ReplayError::Truncated { field })?;
        let s = std::str::from_utf8(&rest[..len])
            .map_err(|_| ReplayError::InvalidUtf8 { field })?
            .to_string();
        self.pos += len + 1;
        Ok(s)
    }
}
