//! The record log: a stream of tag-prefixed, length-prefixed records on a backing file. Every
//! record occupies a whole number of fixed-size frames so record offsets are stable across
//! record and replay and can serve as rollback anchors.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::Error;
use crate::vcpu::VcpuSnapshot;

/// The frame size; every record is padded to a multiple of this.
pub const RECORD_FRAME: u64 = 64;

/// Record tags.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum LogTag {
    /// A full VCPU snapshot.
    Ms = 1,
    /// An interrupt delivery.
    Intr = 2,
    /// A port read.
    In = 3,
    /// A string port read.
    Ins = 4,
    /// A port write.
    Out = 5,
    /// A string port write.
    Outs = 6,
    /// A micro-replay boundary marker.
    Mrep = 7,
    /// The guest hit its panic entry point.
    Panic = 8,
    /// Normal termination.
    Exit = 9,
}

/// The payload of an interrupt record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IntrRecord {
    pub vector: u8,
    pub error_code: u32,
    pub n_exec: u64,
    /// The guest eip the interrupt was injected at; micro-replay blacklists these.
    pub eip: u32,
}

impl IntrRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.vector];
        out.extend_from_slice(&self.error_code.to_le_bytes());
        out.extend_from_slice(&self.n_exec.to_le_bytes());
        out.extend_from_slice(&self.eip.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 17 {
            return Err(Error::TruncatedLog);
        }
        Ok(Self {
            vector: buf[0],
            error_code: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
            n_exec: u64::from_le_bytes(buf[5..13].try_into().unwrap()),
            eip: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
        })
    }
}

/// The payload of a port-I/O record (`IN`/`OUT`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoRecord {
    pub port: u16,
    pub size: u8,
    pub value: u32,
    pub n_exec: u64,
}

impl IoRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(15);
        out.extend_from_slice(&self.port.to_le_bytes());
        out.push(self.size);
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.n_exec.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 15 {
            return Err(Error::TruncatedLog);
        }
        Ok(Self {
            port: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            size: buf[2],
            value: u32::from_le_bytes(buf[3..7].try_into().unwrap()),
            n_exec: u64::from_le_bytes(buf[7..15].try_into().unwrap()),
        })
    }
}

/// The payload of a string-I/O record (`INS`/`OUTS`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StringIoRecord {
    pub port: u16,
    pub size: u8,
    pub count: u32,
    pub n_exec: u64,
    pub buffer: Vec<u8>,
}

impl StringIoRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(15 + self.buffer.len());
        out.extend_from_slice(&self.port.to_le_bytes());
        out.push(self.size);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.n_exec.to_le_bytes());
        out.extend_from_slice(&self.buffer);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 15 {
            return Err(Error::TruncatedLog);
        }
        let count = u32::from_le_bytes(buf[3..7].try_into().unwrap());
        let size = buf[2];
        let n = (count as usize) * (size as usize);
        if buf.len() < 15 + n {
            return Err(Error::TruncatedLog);
        }
        Ok(Self {
            port: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            size,
            count,
            n_exec: u64::from_le_bytes(buf[7..15].try_into().unwrap()),
            buffer: buf[15..15 + n].to_vec(),
        })
    }
}

/// Serializes a VCPU snapshot for an `MS` record.
pub fn encode_snapshot(s: &VcpuSnapshot) -> Vec<u8> {
    let mut out = Vec::with_capacity(192);
    out.extend_from_slice(&s.eip.to_le_bytes());
    for r in s.regs.iter() {
        out.extend_from_slice(&r.to_le_bytes());
    }
    out.extend_from_slice(&s.eflags.to_le_bytes());
    for seg in s.segs.iter() {
        out.extend_from_slice(&seg.selector.to_le_bytes());
        out.extend_from_slice(&seg.base.to_le_bytes());
        out.extend_from_slice(&seg.limit.to_le_bytes());
        out.extend_from_slice(&seg.flags.to_le_bytes());
    }
    out.extend_from_slice(&s.gdt.base.to_le_bytes());
    out.extend_from_slice(&s.gdt.limit.to_le_bytes());
    out.extend_from_slice(&s.idt.base.to_le_bytes());
    out.extend_from_slice(&s.idt.limit.to_le_bytes());
    for cr in s.cr.iter() {
        out.extend_from_slice(&cr.to_le_bytes());
    }
    out.extend_from_slice(&s.intr_flag.to_le_bytes());
    out.extend_from_slice(&s.n_exec.to_le_bytes());
    out
}

/// Deserializes an `MS` record payload.
pub fn decode_snapshot(buf: &[u8]) -> Result<VcpuSnapshot, Error> {
    let mut pos = 0usize;
    let mut take4 = |buf: &[u8]| -> Result<u32, Error> {
        if pos + 4 > buf.len() {
            return Err(Error::TruncatedLog);
        }
        let v = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        Ok(v)
    };
    let mut s = VcpuSnapshot {
        eip: take4(buf)?,
        regs: [0; 8],
        eflags: 0,
        segs: Default::default(),
        gdt: Default::default(),
        idt: Default::default(),
        cr: [0; 5],
        intr_flag: 0,
        n_exec: 0,
    };
    for i in 0..8 {
        s.regs[i] = take4(buf)?;
    }
    s.eflags = take4(buf)?;
    for i in 0..6 {
        s.segs[i].selector = take4(buf)?;
        s.segs[i].base = take4(buf)?;
        s.segs[i].limit = take4(buf)?;
        s.segs[i].flags = take4(buf)?;
    }
    s.gdt.base = take4(buf)?;
    s.gdt.limit = take4(buf)?;
    s.idt.base = take4(buf)?;
    s.idt.limit = take4(buf)?;
    for i in 0..5 {
        s.cr[i] = take4(buf)?;
    }
    if pos + 10 > buf.len() {
        return Err(Error::TruncatedLog);
    }
    s.intr_flag = u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap());
    s.n_exec = u64::from_le_bytes(buf[pos + 2..pos + 10].try_into().unwrap());
    Ok(s)
}

/// The log itself: a positioned file of frames.
pub struct RrLog {
    file: File,
}

impl RrLog {
    /// Creates (or truncates) a log file for recording.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens an existing log for replay.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn tell(&mut self) -> Result<u64, Error> {
        Ok(self.file.stream_position()?)
    }

    pub fn seek(&mut self, offset: u64) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn rewind(&mut self) -> Result<(), Error> {
        self.seek(0)
    }

    /// Appends one record at the current position and returns the offset it starts at.
    pub fn write_record(&mut self, tag: LogTag, payload: &[u8]) -> Result<u64, Error> {
        let offset = self.tell()?;
        debug_assert_eq!(offset % RECORD_FRAME, 0);
        let total = 5 + payload.len() as u64;
        let frames = (total + RECORD_FRAME - 1) / RECORD_FRAME;
        let mut buf = Vec::with_capacity((frames * RECORD_FRAME) as usize);
        buf.push(tag as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf.resize((frames * RECORD_FRAME) as usize, 0);
        self.file.write_all(&buf)?;
        Ok(offset)
    }

    /// Reads the record at the current position, advancing past it. `Ok(None)` at the end of
    /// the log.
    pub fn read_record(&mut self) -> Result<Option<(LogTag, Vec<u8>, u64)>, Error> {
        let offset = self.tell()?;
        let mut header = [0u8; 5];
        match self.file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let tag = match LogTag::from_u8(header[0]) {
            Some(t) => t,
            None if header[0] == 0 => return Ok(None),
            None => return Err(Error::ReplayDivergence("unknown record tag")),
        };
        let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;
        // Skip the frame padding.
        let total = 5 + len as u64;
        let frames = (total + RECORD_FRAME - 1) / RECORD_FRAME;
        self.seek(offset + frames * RECORD_FRAME)?;
        Ok(Some((tag, payload, offset)))
    }

    /// Truncates the log at the current position (used when recording resumes mid-file after
    /// a rollback).
    pub fn truncate_here(&mut self) -> Result<(), Error> {
        let pos = self.tell()?;
        self.file.set_len(pos)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcpu::Vcpu;

    fn temp_log() -> (tempfile::TempDir, RrLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = RrLog::create(&dir.path().join("rr.log")).unwrap();
        (dir, log)
    }

    #[test]
    fn records_roundtrip_with_stable_offsets() {
        let (_dir, mut log) = temp_log();
        let io = IoRecord {
            port: 0x60,
            size: 1,
            value: 0x1c,
            n_exec: 1234,
        };
        let off1 = log.write_record(LogTag::In, &io.encode()).unwrap();
        let intr = IntrRecord {
            vector: 0x20,
            error_code: 0,
            n_exec: 2000,
            eip: 0x7c21,
        };
        let off2 = log.write_record(LogTag::Intr, &intr.encode()).unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, RECORD_FRAME);

        log.rewind().unwrap();
        let (tag, payload, off) = log.read_record().unwrap().unwrap();
        assert_eq!(tag, LogTag::In);
        assert_eq!(off, off1);
        assert_eq!(IoRecord::decode(&payload).unwrap(), io);
        let (tag, payload, off) = log.read_record().unwrap().unwrap();
        assert_eq!(tag, LogTag::Intr);
        assert_eq!(off, off2);
        assert_eq!(IntrRecord::decode(&payload).unwrap(), intr);
        assert!(log.read_record().unwrap().is_none());
    }

    #[test]
    fn large_records_span_frames() {
        let (_dir, mut log) = temp_log();
        let rec = StringIoRecord {
            port: 0x1f0,
            size: 2,
            count: 256,
            n_exec: 99,
            buffer: (0..512).map(|i| i as u8).collect(),
        };
        log.write_record(LogTag::Ins, &rec.encode()).unwrap();
        let off2 = log.write_record(LogTag::Exit, &[]).unwrap();
        assert_eq!(off2 % RECORD_FRAME, 0);
        assert!(off2 >= 512);

        log.rewind().unwrap();
        let (tag, payload, _) = log.read_record().unwrap().unwrap();
        assert_eq!(tag, LogTag::Ins);
        assert_eq!(StringIoRecord::decode(&payload).unwrap(), rec);
        let (tag, _, _) = log.read_record().unwrap().unwrap();
        assert_eq!(tag, LogTag::Exit);
    }

    #[test]
    fn snapshot_record_roundtrip() {
        let mut vcpu = Vcpu::default();
        vcpu.reset();
        vcpu.regs[0] = 0x1111;
        vcpu.n_exec = 777;
        let snap = crate::vcpu::VcpuSnapshot::capture(&vcpu);
        let decoded = decode_snapshot(&encode_snapshot(&snap)).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn seek_back_rereads_the_same_record() {
        let (_dir, mut log) = temp_log();
        let io = IoRecord {
            port: 0x2345,
            size: 4,
            value: 0xdead_beef,
            n_exec: 5,
        };
        let off = log.write_record(LogTag::Out, &io.encode()).unwrap();
        log.write_record(LogTag::Exit, &[]).unwrap();
        log.seek(off).unwrap();
        let (tag, payload, _) = log.read_record().unwrap().unwrap();
        assert_eq!(tag, LogTag::Out);
        assert_eq!(IoRecord::decode(&payload).unwrap(), io);
    }
}
