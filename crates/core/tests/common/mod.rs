//! Byte-stream builders shared by the integration tests.

#![allow(dead_code)]

pub fn jpeg() -> Vec<u8> {
    let mut file = vec![0xff, 0xd8];
    file.extend_from_slice(&[0xff, 0xe0, 0x00, 0x10]);
    file.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
    file.extend_from_slice(&[0xff, 0xda, 0x00, 0x08, 1, 1, 0, 0, 0x3f, 0]);
    file.extend_from_slice(&[0x12, 0x34, 0xff, 0x00, 0x56]);
    file.extend_from_slice(&[0xff, 0xd9]);
    file
}

pub fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

pub fn ftyp() -> Vec<u8> {
    let mut payload = b"isom".to_vec();
    payload.extend_from_slice(&512_u32.to_be_bytes());
    payload.extend_from_slice(b"isomavc1");
    boxed(b"ftyp", &payload)
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bit: usize,
}

impl BitWriter {
    fn bit(&mut self, value: u32) {
        if self.bit % 8 == 0 {
            self.bytes.push(0);
        }
        if value != 0 {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> (self.bit % 8);
        }
        self.bit += 1;
    }

    fn bits(&mut self, value: u32, count: u32) {
        for shift in (0..count).rev() {
            self.bit((value >> shift) & 1);
        }
    }

    fn ue(&mut self, value: u32) {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros();
        for _ in 0..len - 1 {
            self.bit(0);
        }
        for shift in (0..len).rev() {
            self.bit(((code >> shift) & 1) as u32);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.bit(1);
        self.bytes
    }
}

/// Baseline SPS for a 320x240 progressive picture.
pub fn sps() -> Vec<u8> {
    let mut w = BitWriter::default();
    w.bits(66, 8);
    w.bits(0xc0, 8);
    w.bits(30, 8);
    w.ue(0);
    w.ue(0);
    w.ue(0);
    w.ue(0);
    w.ue(1);
    w.bit(0);
    w.ue(19);
    w.ue(14);
    w.bit(1);
    w.bit(1);
    w.bit(0);
    w.bit(0);
    let mut nal = vec![0x67];
    nal.extend(w.finish());
    nal
}

pub fn pps() -> Vec<u8> {
    vec![0x68, 0xce, 0x38, 0x80]
}

/// One-slice frame; `first_mb_in_slice` is zero so every slice opens a new frame.
pub fn frame(idr: bool, filler: usize) -> Vec<u8> {
    let mut w = BitWriter::default();
    w.ue(0);
    w.ue(if idr { 7 } else { 5 });
    let mut nal = vec![if idr { 0x65 } else { 0x41 }];
    nal.extend(w.finish());
    nal.extend(std::iter::repeat(0x5a).take(filler));
    nal
}

pub fn length_prefixed(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// A camera recording interrupted before the index was written: `ftyp + mdat`, where
/// the media data holds `frames` complete H.264 frames and no `moov` follows.
pub fn unfinished_recording(frames: usize) -> Vec<u8> {
    let mut nals = vec![sps(), pps()];
    for index in 0..frames {
        nals.push(frame(index % 5 == 0, 300 + index * 7));
    }
    let mut file = ftyp();
    file.extend(boxed(b"mdat", &length_prefixed(&nals)));
    file
}
