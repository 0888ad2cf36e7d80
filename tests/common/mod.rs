//! Builds pickled records the way numpy lays them out, protocol 4 without framing.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

pub struct RecordBuilder {
    buf: Vec<u8>,
}

impl RecordBuilder {
    pub fn new() -> RecordBuilder {
        // PROTO 4, EMPTY_DICT
        RecordBuilder { buf: vec![0x80, 4, b'}'] }
    }

    /// `key: ndarray` with the given descriptor (`<f4`, `>u2`, `|u1`, ...).
    pub fn array(mut self, key: &str, descr: &str, shape: &[usize], fortran: bool, data: &[u8]) -> Self {
        self.text_op(key);

        self.global("numpy.core.multiarray", "_reconstruct");
        self.global("numpy", "ndarray");
        self.buf.extend_from_slice(&[b'K', 0, 0x85]);
        self.buf.extend_from_slice(&[b'C', 1, b'b', 0x87, b'R']);

        // (1, shape, dtype, is_fortran, rawdata)
        self.buf.extend_from_slice(&[b'(', b'K', 1, b'(']);
        for &d in shape {
            self.buf.push(b'J');
            self.buf.extend_from_slice(&(d as i32).to_le_bytes());
        }
        self.buf.push(b't');

        let (order, code) = match descr.chars().next() {
            Some(c @ ('<' | '>' | '|' | '=')) => (c, &descr[1..]),
            _ => ('<', descr),
        };
        self.global("numpy", "dtype");
        self.text_op(code);
        self.buf.extend_from_slice(&[0x89, 0x88, 0x87, b'R']);
        self.buf.extend_from_slice(&[b'(', b'K', 3]);
        self.text_op(&order.to_string());
        self.buf.extend_from_slice(b"NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb");

        self.buf.push(if fortran { 0x88 } else { 0x89 });
        self.buf.push(b'B');
        self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"tbs");
        self
    }

    pub fn text(mut self, key: &str, value: &str) -> Self {
        self.text_op(key);
        self.text_op(value);
        self.buf.push(b's');
        self
    }

    pub fn int(mut self, key: &str, value: i32) -> Self {
        self.text_op(key);
        self.buf.push(b'J');
        self.buf.extend_from_slice(&value.to_le_bytes());
        self.buf.push(b's');
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(b'.');
        self.buf
    }

    fn text_op(&mut self, s: &str) {
        // SHORT_BINUNICODE
        self.buf.push(0x8c);
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn global(&mut self, module: &str, name: &str) {
        self.text_op(module);
        self.text_op(name);
        // STACK_GLOBAL
        self.buf.push(0x93);
    }
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn write_record(dir: &Path, name: &str, pickle: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, pickle).unwrap();
    path
}

/// 50x50x3 u1 image, the shape of the sample data the converter was made for
pub fn teapot() -> Vec<u8> {
    let data: Vec<u8> = (0..50 * 50 * 3).map(|i| (i % 251) as u8).collect();
    RecordBuilder::new()
        .array("image", "|u1", &[50, 50, 3], false, &data)
        .text("name", "teapot")
        .finish()
}
