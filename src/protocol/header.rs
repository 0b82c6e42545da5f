//! SMB1 header framing, request access and response assembly.

use crate::error::{Error, NtStatus, Result};
use crate::protocol::constants::{
    HeaderFlags, HeaderFlags2, MIN_SMB_SIZE, NO_MORE_ANDX_COMMAND, SMB_HEADER_SIZE, SMB_MAGIC,
};
use byteorder::{ByteOrder, LittleEndian};

/// Parsed 32-byte SMB1 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbHeader {
    pub command: u8,
    pub status: u32,
    pub flags: HeaderFlags,
    pub flags2: HeaderFlags2,
    pub pid_high: u16,
    pub signature: [u8; 8],
    pub tid: u16,
    pub pid: u16,
    pub uid: u16,
    pub mid: u16,
}

impl SmbHeader {
    /// Parse a header from the start of an SMB message.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SMB_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                need: SMB_HEADER_SIZE,
                have: buf.len(),
            });
        }
        if buf[0..4] != SMB_MAGIC {
            return Err(Error::InvalidHeader("bad protocol marker".to_string()));
        }

        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[14..22]);

        Ok(Self {
            command: buf[4],
            status: LittleEndian::read_u32(&buf[5..9]),
            flags: HeaderFlags::from_bits_truncate(buf[9]),
            flags2: HeaderFlags2::from_bits_truncate(LittleEndian::read_u16(&buf[10..12])),
            pid_high: LittleEndian::read_u16(&buf[12..14]),
            signature,
            tid: LittleEndian::read_u16(&buf[24..26]),
            pid: LittleEndian::read_u16(&buf[26..28]),
            uid: LittleEndian::read_u16(&buf[28..30]),
            mid: LittleEndian::read_u16(&buf[30..32]),
        })
    }

    /// Header for the response to this request: identifiers copied, the
    /// RESPONSE flag set and 32-bit error statuses enabled.
    pub fn response(&self) -> Self {
        Self {
            command: self.command,
            status: 0,
            flags: self.flags | HeaderFlags::RESPONSE,
            flags2: self.flags2 | HeaderFlags2::ERR_STATUS,
            pid_high: self.pid_high,
            signature: [0u8; 8],
            tid: self.tid,
            pid: self.pid,
            uid: self.uid,
            mid: self.mid,
        }
    }

    /// Serialize this header into `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&SMB_MAGIC);
        out.push(self.command);
        out.extend_from_slice(&self.status.to_le_bytes());
        out.push(self.flags.bits());
        out.extend_from_slice(&self.flags2.bits().to_le_bytes());
        out.extend_from_slice(&self.pid_high.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.mid.to_le_bytes());
    }

    /// Whether the client marked the request unicode.
    pub fn is_unicode(&self) -> bool {
        self.flags2.contains(HeaderFlags2::UNICODE)
    }
}

/// AndX chaining fields at the head of a parameter block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AndX {
    /// Next chained command, or `NO_MORE_ANDX_COMMAND`
    pub command: u8,
    /// Offset of the next request block from the SMB header
    pub offset: u16,
}

impl AndX {
    /// Read AndX fields from the first four bytes of a word block.
    pub fn parse(words: &[u8]) -> Result<Self> {
        if words.len() < 4 {
            return Err(Error::Malformed("truncated AndX block".to_string()));
        }
        Ok(Self {
            command: words[0],
            offset: LittleEndian::read_u16(&words[2..4]),
        })
    }

    /// Whether the chain ends here.
    pub fn is_terminator(&self) -> bool {
        self.command == NO_MORE_ANDX_COMMAND
    }
}

/// Read-only view over one framed SMB request
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    buf: &'a [u8],
}

impl<'a> Request<'a> {
    /// Wrap a complete SMB message (no RFC1002 prefix) after a length check.
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < MIN_SMB_SIZE {
            return Err(Error::BufferTooSmall {
                need: MIN_SMB_SIZE,
                have: buf.len(),
            });
        }
        Ok(Self { buf })
    }

    /// The whole message.
    pub fn raw(&self) -> &'a [u8] {
        self.buf
    }

    /// Parse the header.
    pub fn header(&self) -> Result<SmbHeader> {
        SmbHeader::parse(self.buf)
    }

    /// WordCount at the command block starting at `block`.
    pub fn word_count(&self, block: usize) -> Result<u8> {
        self.buf
            .get(block)
            .copied()
            .ok_or_else(|| Error::Malformed("block offset out of range".to_string()))
    }

    /// Parameter words of the block at `block`, length-validated.
    pub fn words(&self, block: usize) -> Result<&'a [u8]> {
        let wct = self.word_count(block)? as usize;
        let start = block + 1;
        let end = start + wct * 2;
        if end + 2 > self.buf.len() {
            return Err(Error::Malformed(format!(
                "word block exceeds message: wct {} at {}",
                wct, block
            )));
        }
        Ok(&self.buf[start..end])
    }

    /// Data bytes of the block at `block`, length-validated against ByteCount.
    pub fn data(&self, block: usize) -> Result<&'a [u8]> {
        let wct = self.word_count(block)? as usize;
        let bcc_off = block + 1 + wct * 2;
        if bcc_off + 2 > self.buf.len() {
            return Err(Error::Malformed("missing ByteCount".to_string()));
        }
        let bcc = LittleEndian::read_u16(&self.buf[bcc_off..bcc_off + 2]) as usize;
        let start = bcc_off + 2;
        if start + bcc > self.buf.len() {
            return Err(Error::Malformed(format!(
                "ByteCount {} exceeds message length {}",
                bcc,
                self.buf.len()
            )));
        }
        Ok(&self.buf[start..start + bcc])
    }

    /// Absolute offset (from the SMB header) where the data section of the
    /// block at `block` begins.
    pub fn data_start(&self, block: usize) -> Result<usize> {
        let wct = self.word_count(block)? as usize;
        Ok(block + 1 + wct * 2 + 2)
    }

    /// Bytes starting at an absolute header-relative offset.
    pub fn from_offset(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        if offset + len > self.buf.len() {
            return Err(Error::Malformed(format!(
                "offset {}+{} exceeds message length {}",
                offset,
                len,
                self.buf.len()
            )));
        }
        Ok(&self.buf[offset..offset + len])
    }
}

/// Response under construction.
///
/// The buffer always starts with the 32-byte header; AndX handlers append
/// their blocks and the dispatcher patches chained offsets as it walks.
#[derive(Debug)]
pub struct ReplyBuf {
    buf: Vec<u8>,
    andx_patch: Option<usize>,
    /// Response suppressed (signing mismatch or cancellation)
    suppressed: bool,
}

impl ReplyBuf {
    /// Start a response for `req_hdr` with the given capacity hint.
    pub fn new(req_hdr: &SmbHeader, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        req_hdr.response().write_to(&mut buf);
        Self {
            buf,
            andx_patch: None,
            suppressed: false,
        }
    }

    /// Stamp an NTSTATUS into the header.
    pub fn set_status(&mut self, status: NtStatus) {
        LittleEndian::write_u32(&mut self.buf[5..9], status as u32);
    }

    /// Current NTSTATUS in the header.
    pub fn status(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[5..9])
    }

    /// Override the UID field (after session setup mints one).
    pub fn set_uid(&mut self, uid: u16) {
        LittleEndian::write_u16(&mut self.buf[28..30], uid);
    }

    /// Override the TID field (after tree connect assigns one).
    pub fn set_tid(&mut self, tid: u16) {
        LittleEndian::write_u16(&mut self.buf[24..26], tid);
    }

    /// Append a plain (non-AndX) block: WordCount, words, ByteCount, data.
    pub fn block(&mut self, words: &[u8], data: &[u8]) {
        debug_assert!(words.len() % 2 == 0);
        self.buf.push((words.len() / 2) as u8);
        self.buf.extend_from_slice(words);
        self.buf
            .extend_from_slice(&(data.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(data);
    }

    /// Append an AndX block. `words` excludes the four AndX bytes, which are
    /// written here with a placeholder offset for the dispatcher to patch.
    pub fn andx_block(&mut self, next_command: u8, words: &[u8], data: &[u8]) {
        debug_assert!(words.len() % 2 == 0);
        self.buf.push(((words.len() + 4) / 2) as u8);
        self.buf.push(next_command);
        self.buf.push(0);
        self.andx_patch = Some(self.buf.len());
        self.buf.extend_from_slice(&0u16.to_le_bytes());
        self.buf.extend_from_slice(words);
        self.buf
            .extend_from_slice(&(data.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(data);
    }

    /// Point the most recent AndX block at the current end of the buffer,
    /// where the next chained response block will be written.
    pub fn patch_andx_to_here(&mut self) {
        if let Some(pos) = self.andx_patch.take() {
            let here = self.buf.len() as u16;
            LittleEndian::write_u16(&mut self.buf[pos..pos + 2], here);
        }
    }

    /// Length so far, measured from the SMB header.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when only the header has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == SMB_HEADER_SIZE
    }

    /// Mark this response as never-to-be-sent.
    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    /// Whether the response was suppressed.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Mutable access for signing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Finished message bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::command;

    fn sample_request() -> Vec<u8> {
        let hdr = SmbHeader {
            command: command::ECHO,
            status: 0,
            flags: HeaderFlags::CASELESS,
            flags2: HeaderFlags2::UNICODE,
            pid_high: 0,
            signature: [0; 8],
            tid: 7,
            pid: 1234,
            uid: 2,
            mid: 42,
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf);
        buf.push(1); // WordCount
        buf.extend_from_slice(&3u16.to_le_bytes()); // EchoCount
        buf.extend_from_slice(&2u16.to_le_bytes()); // ByteCount
        buf.extend_from_slice(b"hi");
        buf
    }

    #[test]
    fn test_header_round_trip() {
        let buf = sample_request();
        let hdr = SmbHeader::parse(&buf).unwrap();
        assert_eq!(hdr.command, command::ECHO);
        assert_eq!(hdr.tid, 7);
        assert_eq!(hdr.pid, 1234);
        assert_eq!(hdr.uid, 2);
        assert_eq!(hdr.mid, 42);
        assert!(hdr.is_unicode());

        let mut out = Vec::new();
        hdr.write_to(&mut out);
        assert_eq!(&out[..], &buf[..SMB_HEADER_SIZE]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = sample_request();
        buf[0] = 0xFE;
        assert!(SmbHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_request_words_and_data() {
        let buf = sample_request();
        let req = Request::new(&buf).unwrap();
        let words = req.words(SMB_HEADER_SIZE).unwrap();
        assert_eq!(words, &3u16.to_le_bytes());
        let data = req.data(SMB_HEADER_SIZE).unwrap();
        assert_eq!(data, b"hi");
    }

    #[test]
    fn test_request_rejects_overlong_byte_count() {
        let mut buf = sample_request();
        let len = buf.len();
        // Corrupt ByteCount to exceed the message
        buf[len - 4] = 0xFF;
        let req = Request::new(&buf).unwrap();
        assert!(req.data(SMB_HEADER_SIZE).is_err());
    }

    #[test]
    fn test_response_header_flags() {
        let buf = sample_request();
        let hdr = SmbHeader::parse(&buf).unwrap();
        let rsp = hdr.response();
        assert!(rsp.flags.contains(HeaderFlags::RESPONSE));
        assert!(rsp.flags2.contains(HeaderFlags2::ERR_STATUS));
        assert_eq!(rsp.mid, hdr.mid);
    }

    #[test]
    fn test_reply_andx_patching() {
        let buf = sample_request();
        let hdr = SmbHeader::parse(&buf).unwrap();
        let mut reply = ReplyBuf::new(&hdr, 128);
        reply.andx_block(command::TREE_CONNECT_ANDX, &[0u8; 2], &[]);
        let first_block_len = reply.len();
        reply.patch_andx_to_here();
        reply.block(&[], &[]);

        let bytes = reply.into_vec();
        // AndX offset field lives right after WordCount, command and reserved
        let off = LittleEndian::read_u16(&bytes[SMB_HEADER_SIZE + 3..SMB_HEADER_SIZE + 5]);
        assert_eq!(off as usize, first_block_len);
    }

    #[test]
    fn test_andx_terminator() {
        let andx = AndX::parse(&[0xFF, 0, 0, 0]).unwrap();
        assert!(andx.is_terminator());
        let andx = AndX::parse(&[command::READ_ANDX, 0, 0x40, 0]).unwrap();
        assert!(!andx.is_terminator());
        assert_eq!(andx.offset, 0x40);
    }
}
