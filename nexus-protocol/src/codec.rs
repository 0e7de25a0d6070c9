// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The length-prefixed byte framing used both for the outer wire frame and
//! for built-in packet bodies that want to carry raw byte arrays rather than
//! JSON.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// One framed message on the wire: a type name and an opaque payload.
///
/// ```text
/// uint32_be type_name_len
/// UTF-8     type_name_bytes    (type_name_len bytes)
/// uint32_be data_len
/// bytes     data               (data_len bytes)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketData {
    pub type_name: String,
    pub data: Vec<u8>,
}

impl PacketData {
    pub fn new(type_name: impl Into<String>, data: Vec<u8>) -> PacketData {
        PacketData { type_name: type_name.into(), data }
    }

    /// Writes this frame to `w`. Big-endian length prefixes, as required by
    /// the wire format.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let name_bytes = self.type_name.as_bytes();
        w.write_u32::<BigEndian>(name_bytes.len() as u32)?;
        w.write_all(name_bytes)?;
        w.write_u32::<BigEndian>(self.data.len() as u32)?;
        w.write_all(&self.data)?;
        Ok(())
    }

    /// Reads one frame from `r`. Returns `Ok(None)` on a clean EOF before any
    /// bytes of a new frame have been read (peer closed), and an `Err` for
    /// any other I/O failure, including a frame that starts but is
    /// truncated partway through.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<PacketData>> {
        let name_len = match r.read_u32::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut name_buf = vec![0u8; name_len as usize];
        r.read_exact(&mut name_buf)?;
        let type_name = String::from_utf8(name_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let data_len = r.read_u32::<BigEndian>()?;
        let mut data = vec![0u8; data_len as usize];
        r.read_exact(&mut data)?;

        Ok(Some(PacketData { type_name, data }))
    }
}

/// A growable buffer writer for building up the raw byte payload of a packet
/// that wants to carry binary data (rather than JSON) — length-prefixed
/// strings and byte arrays, matching the table/registry wire helpers that
/// ship raw key/value bytes.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> ByteWriter {
        ByteWriter { buf: Vec::new() }
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_byte_array(s.as_bytes())
    }

    pub fn write_byte_array(&mut self, b: &[u8]) -> &mut Self {
        self.buf.write_u32::<BigEndian>(b.len() as u32).expect("writes to a Vec never fail");
        self.buf.write_all(b).expect("writes to a Vec never fail");
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// The inverse of [`ByteWriter`]: reads length-prefixed strings and byte
/// arrays out of a contiguous buffer, failing with [`ShortRead`] rather than
/// panicking when the buffer runs out early.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

#[derive(Debug)]
pub struct ShortRead;

impl std::fmt::Display for ShortRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "read past the end of the buffer")
    }
}
impl std::error::Error for ShortRead {}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> ByteReader<'a> {
        ByteReader { buf, pos: 0 }
    }

    pub fn read_byte_array(&mut self) -> Result<&'a [u8], ShortRead> {
        if self.buf.len() < self.pos + 4 {
            return Err(ShortRead);
        }
        let len = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        if self.buf.len() < self.pos + len {
            return Err(ShortRead);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<&'a str, ShortRead> {
        let bytes = self.read_byte_array()?;
        std::str::from_utf8(bytes).map_err(|_| ShortRead)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_data_round_trip() {
        let pkt = PacketData::new("table:item_add", b"hello world".to_vec());
        let mut buf = Vec::new();
        pkt.write_to(&mut buf).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let read_back = PacketData::read_from(&mut cursor).unwrap().unwrap();
        assert_eq!(read_back, pkt);
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut cursor = io::Cursor::new(Vec::<u8>::new());
        assert!(PacketData::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(5).unwrap();
        buf.extend_from_slice(b"ab"); // short
        let mut cursor = io::Cursor::new(buf);
        assert!(PacketData::read_from(&mut cursor).is_err());
    }

    #[test]
    fn byte_reader_writer_round_trip() {
        let mut w = ByteWriter::new();
        w.write_string("k1").write_byte_array(&[1, 2, 3]);
        let bytes = w.finish();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "k1");
        assert_eq!(r.read_byte_array().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn byte_reader_short_read() {
        let mut r = ByteReader::new(&[0, 0, 0, 10]); // claims 10 bytes, has 0
        assert!(r.read_byte_array().is_err());
    }
}
