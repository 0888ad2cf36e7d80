use std::collections::HashMap;
use std::io::{self, BufRead, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use tracing::{debug, trace};

use super::objects::{build, call, set_item};
use super::opcodes::*;
use super::{Global, PickleError, Value};

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::dtype::ByteOrder;
    use crate::image::Order;
    use crate::pickle::from_slice;

    // {'image': np.arange(6, dtype='f4').reshape(2, 3), 'n': 3} at protocol 2
    const NUMPY_P2: &[u8] = b"\x80\x02}q\x00(X\x05\x00\x00\x00imageq\x01cnumpy.core.multiarray\n_reconstruct\nq\x02\
cnumpy\nndarray\nq\x03K\x00\x85q\x04c_codecs\nencode\nq\x05X\x01\x00\x00\x00bq\x06X\x06\x00\x00\x00latin1q\x07\x86q\x08\
Rq\x09\x87q\nRq\x0b(K\x01K\x02K\x03\x86q\x0ccnumpy\ndtype\nq\x0dX\x02\x00\x00\x00f4q\x0e\x89\x88\x87q\x0fRq\x10(K\x03\
X\x01\x00\x00\x00<q\x11NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tq\x12b\x89h\x05X\x1b\x00\x00\x00\x00\x00\x00\x00\x00\
\x00\xc2\x80?\x00\x00\x00@\x00\x00@@\x00\x00\xc2\x80@\x00\x00\xc2\xa0@q\x13h\x07\x86q\x14Rq\x15tq\x16bX\x01\x00\x00\x00\
nq\x17K\x03u.";

    // the same record at protocol 4
    const NUMPY_P4: &[u8] = b"\x80\x04\x95\xb4\x00\x00\x00\x00\x00\x00\x00}\x94(\x8c\x05image\x94\x8c\x15numpy.core.multiarray\
\x94\x8c\x0c_reconstruct\x94\x93\x94\x8c\x05numpy\x94\x8c\x07ndarray\x94\x93\x94K\x00\x85\x94C\x01b\x94\x87\x94R\x94(K\x01\
K\x02K\x03\x86\x94h\x05\x8c\x05dtype\x94\x93\x94\x8c\x02f4\x94\x89\x88\x87\x94R\x94(K\x03\x8c\x01<\x94NNNJ\xff\xff\xff\xff\
J\xff\xff\xff\xffK\x00t\x94b\x89C\x18\x00\x00\x00\x00\x00\x00\x80?\x00\x00\x00@\x00\x00@@\x00\x00\x80@\x00\x00\xa0@\x94t\
\x94b\x8c\x01n\x94K\x03u.";

    // protocol 5 uses _frombuffer with an in-band buffer
    const NUMPY_P5: &[u8] = b"\x80\x05\x95\x98\x00\x00\x00\x00\x00\x00\x00}\x94(\x8c\x05image\x94\x8c\x12numpy.core.numeric\
\x94\x8c\x0b_frombuffer\x94\x93\x94(C\x18\x00\x00\x00\x00\x00\x00\x80?\x00\x00\x00@\x00\x00@@\x00\x00\x80@\x00\x00\xa0@\
\x94\x8c\x05numpy\x94\x8c\x05dtype\x94\x93\x94\x8c\x02f4\x94\x89\x88\x87\x94R\x94(K\x03\x8c\x01<\x94NNNJ\xff\xff\xff\xff\
J\xff\xff\xff\xffK\x00t\x94bK\x02K\x03\x86\x94\x8c\x01C\x94t\x94R\x94\x8c\x01n\x94K\x03u.";

    // {'image': np.array([7, -1], dtype='<i2'), 'label': 'teapot'} at protocol 0
    const NUMPY_P0: &[u8] = b"(dp0\nVimage\np1\ncnumpy.core.multiarray\n_reconstruct\np2\n(cnumpy\nndarray\np3\n(I0\ntp4\n\
c_codecs\nencode\np5\n(Vb\np6\nVlatin1\np7\ntp8\nRp9\ntp10\nRp11\n(I1\n(I2\ntp12\ncnumpy\ndtype\np13\n(Vi2\np14\nI00\n\
I01\ntp15\nRp16\n(I3\nV<\np17\nNNNI-1\nI-1\nI0\ntp18\nbI00\ng5\n(V\x07\\u0000\xff\xff\np19\ng7\ntp20\nRp21\ntp22\nbsVlabel\n\
p23\nVteapot\np24\ns.";

    // two big-endian uint16 arrays sharing one memoized dtype
    const SHARED_DTYPE: &[u8] = b"\x80\x04\x95\xbd\x00\x00\x00\x00\x00\x00\x00}\x94(\x8c\x05image\x94\x8c\x15numpy.core.multiarray\
\x94\x8c\x0c_reconstruct\x94\x93\x94\x8c\x05numpy\x94\x8c\x07ndarray\x94\x93\x94K\x00\x85\x94C\x01b\x94\x87\x94R\x94(K\x01\
K\x02\x85\x94h\x05\x8c\x05dtype\x94\x93\x94\x8c\x02u2\x94\x89\x88\x87\x94R\x94(K\x03\x8c\x01>\x94NNNJ\xff\xff\xff\xffJ\xff\
\xff\xff\xffK\x00t\x94b\x89C\x04\x00\x01\x00\x02\x94t\x94b\x8c\x04mask\x94h\x04h\x07h\x08h\x09\x87\x94R\x94(K\x01K\x01\x85\
\x94h\x11\x89C\x02\x00\x09\x94t\x94bu.";

    // a writable [[0, 1, 2], [3, 4, 5]] int16 array in Fortran order at protocol 5,
    // stored in a BYTEARRAY8 buffer
    const P5_WRITABLE_FORTRAN: &[u8] = b"\x80\x05\x95\x8c\x00\x00\x00\x00\x00\x00\x00}\x94\x8c\x05image\x94\x8c\x12numpy\
.core.numeric\x94\x8c\x0b_frombuffer\x94\x93\x94(\x96\x0c\x00\x00\x00\x00\x00\x00\x00\x00\x00\x03\x00\x01\x00\x04\x00\
\x02\x00\x05\x00\x94\x8c\x05numpy\x94\x8c\x05dtype\x94\x93\x94\x8c\x02i2\x94\x89\x88\x87\x94R\x94(K\x03\x8c\x01<\x94NN\
NJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00t\x94bK\x02K\x03\x86\x94\x8c\x01F\x94t\x94R\x94s.";

    // collections.OrderedDict(label='teapot', image=np.array([7, 9], 'u1')) at protocol 4
    const ORDERED_DICT: &[u8] = b"\x80\x04\x95\xc6\x00\x00\x00\x00\x00\x00\x00\x8c\x0bcollections\x94\x8c\x0bOrderedDict\
\x94\x93\x94)R\x94(\x8c\x05label\x94\x8c\x06teapot\x94\x8c\x05image\x94\x8c\x15numpy.core.multiarray\x94\x8c\x0c_recon\
struct\x94\x93\x94\x8c\x05numpy\x94\x8c\x07ndarray\x94\x93\x94K\x00\x85\x94C\x01b\x94\x87\x94R\x94(K\x01K\x02\x85\x94h\
\n\x8c\x05dtype\x94\x93\x94\x8c\x02u1\x94\x89\x88\x87\x94R\x94(K\x03\x8c\x01<\x94NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xff\
K\x00t\x94b\x89C\x02\x07\x09\x94t\x94bu.";

    // {'image': np.array([2.5]), 'mean': np.float64(1.5)} at protocol 2
    const NUMPY_SCALAR: &[u8] = b"\x80\x02}q\x00(X\x05\x00\x00\x00imageq\x01cnumpy.core.multiarray\n_reconstruct\nq\x02c\
numpy\nndarray\nq\x03K\x00\x85q\x04c_codecs\nencode\nq\x05X\x01\x00\x00\x00bq\x06X\x06\x00\x00\x00latin1q\x07\x86q\x08\
Rq\x09\x87q\nRq\x0b(K\x01K\x01\x85q\x0ccnumpy\ndtype\nq\x0dX\x02\x00\x00\x00f8q\x0e\x89\x88\x87q\x0fRq\x10(K\x03X\x01\
\x00\x00\x00<q\x11NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tq\x12b\x89h\x05X\x08\x00\x00\x00\x00\x00\x00\x00\x00\x00\
\x04@q\x13h\x07\x86q\x14Rq\x15tq\x16bX\x04\x00\x00\x00meanq\x17cnumpy.core.multiarray\nscalar\nq\x18h\x0dh\x0e\x89\x88\
\x87q\x19Rq\x1a(K\x03h\x11NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tq\x1bbh\x05X\x09\x00\x00\x00\x00\x00\x00\x00\x00\
\x00\xc3\xb8?q\x1ch\x07\x86q\x1dRq\x1e\x86q\x1fRq u.";

    // {'raw': bytearray(b'ab\xff')} at protocol 2
    const BYTEARRAY_P2: &[u8] = b"\x80\x02}q\x00X\x03\x00\x00\x00rawq\x01c__builtin__\nbytearray\nq\x02c_codecs\nencode\
\nq\x03X\x04\x00\x00\x00ab\xc3\xbfq\x04X\x06\x00\x00\x00latin1q\x05\x86q\x06Rq\x07\x85q\x08Rq\x09s.";

    // the same at protocol 4
    const BYTEARRAY_P4: &[u8] = b"\x80\x04\x95-\x00\x00\x00\x00\x00\x00\x00}\x94\x8c\x03raw\x94\x8c\x08builtins\x94\x8c\
\x09bytearray\x94\x93\x94C\x03ab\xff\x94\x85\x94R\x94s.";

    fn field<'a>(record: &'a Value, key: &str) -> &'a Value {
        match record {
            Value::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v)
                .unwrap(),
            other => panic!("expected a dict, got {other:?}"),
        }
    }

    fn f4_values(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn assert_arange_2x3(record: &Value) {
        let image = field(record, "image").as_array().unwrap();
        assert_eq!(image.shape().dims(), &[2, 3]);
        assert_eq!(image.dtype().descr(), "<f4");
        assert_eq!(image.order(), Order::C);
        assert_eq!(f4_values(image.data()), vec![0., 1., 2., 3., 4., 5.]);
        assert_eq!(field(record, "n"), &Value::Int(3));
    }

    #[test]
    fn numpy_protocol_2() {
        assert_arange_2x3(&from_slice(NUMPY_P2).unwrap());
    }

    #[test]
    fn numpy_protocol_4() {
        assert_arange_2x3(&from_slice(NUMPY_P4).unwrap());
    }

    #[test]
    fn numpy_protocol_5() {
        assert_arange_2x3(&from_slice(NUMPY_P5).unwrap());
    }

    #[test]
    fn numpy_protocol_0() {
        let record = from_slice(NUMPY_P0).unwrap();
        let image = field(&record, "image").as_array().unwrap();
        assert_eq!(image.shape().dims(), &[2]);
        assert_eq!(image.dtype().descr(), "<i2");
        assert_eq!(image.data(), &[0x07, 0x00, 0xff, 0xff]);
        assert_eq!(field(&record, "label").as_str(), Some("teapot"));
    }

    #[test]
    fn memoized_dtype_keeps_its_state() {
        let record = from_slice(SHARED_DTYPE).unwrap();
        let mask = field(&record, "mask").as_array().unwrap();
        assert_eq!(mask.dtype().byte_order(), ByteOrder::Big);
        assert_eq!(mask.to_array::<u16>().unwrap().as_slice().unwrap(), &[9]);
        let image = field(&record, "image").as_array().unwrap();
        assert_eq!(image.to_array::<u16>().unwrap().as_slice().unwrap(), &[1, 2]);
    }

    #[test]
    fn refuses_arbitrary_globals() {
        let err = from_slice(b"cos\nsystem\n(S'echo hi'\ntR.").unwrap_err();
        assert!(matches!(err, PickleError::UnsupportedGlobal { ref module, ref name } if module == "os" && name == "system"));
    }

    #[test]
    fn scalars_and_containers() {
        // (1.5, -2, 2**40, [True, None], {'a': b'xy'}, frozenset({1}))
        let data = b"\x80\x04(G?\xf8\x00\x00\x00\x00\x00\x00J\xfe\xff\xff\xff\x8a\x06\x00\x00\x00\x00\x00\x01]\x94(\x88Ne}\x94\
\x8c\x01a\x94C\x02xy\x94s(K\x01\x91\x94t.";
        let value = from_slice(data).unwrap();
        assert_eq!(
            value,
            Value::Tuple(vec![
                Value::Float(1.5),
                Value::Int(-2),
                Value::Int(1 << 40),
                Value::List(vec![Value::Bool(true), Value::None]),
                Value::Dict(vec![(Value::String("a".into()), Value::Bytes(Rc::from(&b"xy"[..])))]),
                Value::Set(vec![Value::Int(1)]),
            ])
        );
    }

    #[test]
    fn text_string_escapes() {
        let value = from_slice(b"S'a\\'b\\x00\\n'\np0\n.").unwrap();
        assert_eq!(value, Value::Bytes(Rc::from(&b"a'b\x00\n"[..])));
    }

    #[test]
    fn truncated_input() {
        let cut = &NUMPY_P4[..NUMPY_P4.len() / 2];
        assert!(matches!(from_slice(cut), Err(PickleError::UnexpectedEof)));
        assert!(matches!(from_slice(b""), Err(PickleError::UnexpectedEof)));
    }

    #[test]
    fn garbage_input() {
        assert!(matches!(
            from_slice(b"\x80\x04\xff."),
            Err(PickleError::UnknownOpcode { opcode: 0xff, offset: 2 })
        ));
        assert!(matches!(from_slice(b"\x80\x09N."), Err(PickleError::UnsupportedProtocol(9))));
        assert!(matches!(from_slice(b"t."), Err(PickleError::MissingMark(0))));
        assert!(matches!(from_slice(b"."), Err(PickleError::StackUnderflow(0))));
        assert!(matches!(from_slice(b"h\x05."), Err(PickleError::MissingMemo(5))));
    }

    #[test]
    fn writable_buffer_in_fortran_order() {
        let record = from_slice(P5_WRITABLE_FORTRAN).unwrap();
        let image = field(&record, "image").as_array().unwrap();
        assert_eq!(image.order(), Order::Fortran);
        assert_eq!(image.dtype().descr(), "<i2");
        assert_eq!(image.to_array::<i16>().unwrap().as_slice().unwrap(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn readonly_buffer_marks_the_top_of_stack() {
        let value = from_slice(b"\x80\x05\x96\x02\x00\x00\x00\x00\x00\x00\x00ab\x98.").unwrap();
        assert_eq!(value, Value::Bytes(Rc::from(&b"ab"[..])));
        assert!(matches!(from_slice(b"\x80\x05\x98."), Err(PickleError::StackUnderflow(_))));
    }

    #[test]
    fn ordered_dict_record() {
        let record = from_slice(ORDERED_DICT).unwrap();
        match &record {
            Value::Dict(pairs) => {
                let keys: Vec<_> = pairs.iter().map(|(k, _)| k.as_str().unwrap()).collect();
                assert_eq!(keys, vec!["label", "image"]);
            }
            other => panic!("expected a dict, got {other:?}"),
        }
        assert_eq!(field(&record, "image").as_array().unwrap().data(), &[7, 9]);
    }

    #[test]
    fn newobj_ex_without_keywords() {
        let empty = from_slice(b"\x80\x04\x8c\x0bcollections\x8c\x0bOrderedDict\x93)}\x92.").unwrap();
        assert_eq!(empty, Value::Dict(vec![]));
        let with_kwargs = from_slice(b"\x80\x04\x8c\x0bcollections\x8c\x0bOrderedDict\x93)}\x8c\x01aK\x01s\x92.");
        assert!(matches!(with_kwargs, Err(PickleError::Invalid(_))));
    }

    #[test]
    fn numpy_scalar_next_to_array() {
        let record = from_slice(NUMPY_SCALAR).unwrap();
        let image = field(&record, "image").as_array().unwrap();
        assert_eq!(image.to_array::<f64>().unwrap().as_slice().unwrap(), &[2.5]);
        match field(&record, "mean") {
            Value::Scalar { dtype, data } => {
                assert_eq!(dtype.descr(), "<f8");
                assert_eq!(&data[..], &1.5f64.to_le_bytes());
            }
            other => panic!("expected a numpy scalar, got {other:?}"),
        }
    }

    #[test]
    fn bytearray_values() {
        for data in [BYTEARRAY_P2, BYTEARRAY_P4] {
            let record = from_slice(data).unwrap();
            assert_eq!(field(&record, "raw").as_bytes(), Some(&b"ab\xff"[..]));
        }
    }

    #[test]
    fn out_of_band_buffers_are_unsupported() {
        assert!(matches!(
            from_slice(b"\x80\x05\x97."),
            Err(PickleError::UnsupportedOpcode { name: "NEXT_BUFFER", .. })
        ));
    }
}

/// Counts consumed bytes so errors can point at an offset.
struct Counting<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for Counting<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.count += amt as u64;
        self.inner.consume(amt);
    }
}

/// A stack entry and the memo slots that refer to it. Mutations of the entry
/// are copied back to those slots so later `GET`s see the mutated object.
struct Slot {
    value: Value,
    memo_ids: Vec<u32>,
}

/// The pickle stack machine.
pub struct Unpickler<R> {
    reader: Counting<R>,
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
    /// offset of the opcode being executed
    offset: u64,
}

impl<R: BufRead> Unpickler<R> {
    pub fn new(reader: R) -> Unpickler<R> {
        Unpickler {
            reader: Counting { inner: reader, count: 0 },
            stack: vec![],
            marks: vec![],
            memo: HashMap::new(),
            offset: 0,
        }
    }

    /// Run the machine until `STOP` and return the object on top of the stack.
    pub fn load(mut self) -> Result<Value, PickleError> {
        loop {
            self.offset = self.reader.count;
            let op = self.reader.read_u8()?;
            trace!(offset = self.offset, opcode = op, "pickle op");
            if op == STOP {
                let value = self.pop()?;
                debug!(bytes = self.reader.count, memo = self.memo.len(), "decoded pickle");
                return Ok(value);
            }
            self.step(op)?;
        }
    }

    fn step(&mut self, op: u8) -> Result<(), PickleError> {
        match op {
            PROTO => {
                let protocol = self.reader.read_u8()?;
                if protocol > HIGHEST_PROTOCOL {
                    return Err(PickleError::UnsupportedProtocol(protocol));
                }
                debug!(protocol, "pickle protocol");
            }
            FRAME => {
                // frames only group opcodes for buffering
                self.reader.read_u64::<LittleEndian>()?;
            }

            MARK => self.marks.push(self.stack.len()),
            POP => {
                if self.stack.len() > self.floor() {
                    self.stack.pop();
                } else {
                    self.pop_mark()?;
                }
            }
            POP_MARK => {
                self.pop_mark()?;
            }
            DUP => {
                let top = self.top()?;
                let slot = Slot {
                    value: top.value.clone(),
                    memo_ids: top.memo_ids.clone(),
                };
                self.stack.push(slot);
            }

            NONE => self.push(Value::None),
            NEWTRUE => self.push(Value::Bool(true)),
            NEWFALSE => self.push(Value::Bool(false)),
            INT => {
                let line = self.read_text_line()?;
                let value = match line.as_str() {
                    "01" => Value::Bool(true),
                    "00" => Value::Bool(false),
                    digits => Value::Int(parse_int(digits)?),
                };
                self.push(value);
            }
            BININT => {
                let n = self.reader.read_i32::<LittleEndian>()?;
                self.push(Value::Int(i64::from(n)));
            }
            BININT1 => {
                let n = self.reader.read_u8()?;
                self.push(Value::Int(i64::from(n)));
            }
            BININT2 => {
                let n = self.reader.read_u16::<LittleEndian>()?;
                self.push(Value::Int(i64::from(n)));
            }
            LONG => {
                let line = self.read_text_line()?;
                let digits = line.strip_suffix('L').unwrap_or(&line);
                self.push(Value::Int(parse_int(digits)?));
            }
            LONG1 => {
                let len = self.reader.read_u8()?;
                let bytes = self.read_bytes(u64::from(len))?;
                self.push(Value::Int(decode_long(&bytes)?));
            }
            LONG4 => {
                let len = self.read_i32_len()?;
                let bytes = self.read_bytes(len)?;
                self.push(Value::Int(decode_long(&bytes)?));
            }
            FLOAT => {
                let line = self.read_text_line()?;
                let value = line
                    .parse::<f64>()
                    .map_err(|_| PickleError::Invalid(format!("bad float literal {line:?}")))?;
                self.push(Value::Float(value));
            }
            BINFLOAT => {
                let value = self.reader.read_f64::<BigEndian>()?;
                self.push(Value::Float(value));
            }

            STRING => {
                let line = self.read_line()?;
                let bytes = unquote(&line)?;
                self.push(Value::Bytes(bytes.into()));
            }
            BINSTRING => {
                let len = self.read_i32_len()?;
                self.push_bytes(len)?;
            }
            SHORT_BINSTRING | SHORT_BINBYTES => {
                let len = self.reader.read_u8()?;
                self.push_bytes(u64::from(len))?;
            }
            BINBYTES => {
                let len = self.reader.read_u32::<LittleEndian>()?;
                self.push_bytes(u64::from(len))?;
            }
            BINBYTES8 | BYTEARRAY8 => {
                let len = self.reader.read_u64::<LittleEndian>()?;
                self.push_bytes(len)?;
            }
            UNICODE => {
                let line = self.read_line()?;
                self.push(Value::String(raw_unicode_escape(&line)?));
            }
            SHORT_BINUNICODE => {
                let len = self.reader.read_u8()?;
                self.push_unicode(u64::from(len))?;
            }
            BINUNICODE => {
                let len = self.reader.read_u32::<LittleEndian>()?;
                self.push_unicode(u64::from(len))?;
            }
            BINUNICODE8 => {
                let len = self.reader.read_u64::<LittleEndian>()?;
                self.push_unicode(len)?;
            }
            READONLY_BUFFER => {
                self.top()?;
            }

            EMPTY_TUPLE => self.push(Value::Tuple(vec![])),
            TUPLE => {
                let items = self.pop_mark()?;
                self.push(Value::Tuple(items));
            }
            TUPLE1 | TUPLE2 | TUPLE3 => {
                let n = usize::from(op - TUPLE1) + 1;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.pop()?);
                }
                items.reverse();
                self.push(Value::Tuple(items));
            }
            EMPTY_LIST => self.push(Value::List(vec![])),
            LIST => {
                let items = self.pop_mark()?;
                self.push(Value::List(items));
            }
            APPEND => {
                let item = self.pop()?;
                self.extend_top(vec![item])?;
            }
            APPENDS => {
                let items = self.pop_mark()?;
                self.extend_top(items)?;
            }
            EMPTY_DICT => self.push(Value::Dict(vec![])),
            DICT => {
                let items = self.pop_mark()?;
                let mut dict = Value::Dict(vec![]);
                insert_pairs(&mut dict, items)?;
                self.push(dict);
            }
            SETITEM => {
                let value = self.pop()?;
                let key = self.pop()?;
                set_item(self.top_value_mut()?, key, value)?;
                self.sync_top();
            }
            SETITEMS => {
                let items = self.pop_mark()?;
                insert_pairs(self.top_value_mut()?, items)?;
                self.sync_top();
            }
            EMPTY_SET => self.push(Value::Set(vec![])),
            ADDITEMS => {
                let items = self.pop_mark()?;
                self.extend_top(items)?;
            }
            FROZENSET => {
                let items = self.pop_mark()?;
                let mut set = Value::Set(vec![]);
                extend(&mut set, items)?;
                self.push(set);
            }

            PUT => {
                let id = self.read_text_line()?;
                let id = id
                    .parse()
                    .map_err(|_| PickleError::Invalid(format!("bad memo id {id:?}")))?;
                self.memo_put(id)?;
            }
            BINPUT => {
                let id = self.reader.read_u8()?;
                self.memo_put(u32::from(id))?;
            }
            LONG_BINPUT => {
                let id = self.reader.read_u32::<LittleEndian>()?;
                self.memo_put(id)?;
            }
            MEMOIZE => {
                let id = self.memo.len() as u32;
                self.memo_put(id)?;
            }
            GET => {
                let id = self.read_text_line()?;
                let id = id
                    .parse()
                    .map_err(|_| PickleError::Invalid(format!("bad memo id {id:?}")))?;
                self.memo_get(id)?;
            }
            BINGET => {
                let id = self.reader.read_u8()?;
                self.memo_get(u32::from(id))?;
            }
            LONG_BINGET => {
                let id = self.reader.read_u32::<LittleEndian>()?;
                self.memo_get(id)?;
            }

            GLOBAL => {
                let module = self.read_text_line()?;
                let name = self.read_text_line()?;
                let global = resolve_global(module, name)?;
                self.push(Value::Global(global));
            }
            STACK_GLOBAL => {
                let name = self.pop()?;
                let module = self.pop()?;
                match (module, name) {
                    (Value::String(module), Value::String(name)) => {
                        let global = resolve_global(module, name)?;
                        self.push(Value::Global(global));
                    }
                    _ => return Err(PickleError::Invalid("STACK_GLOBAL needs two strings".into())),
                }
            }
            REDUCE | NEWOBJ => {
                let args = self.pop()?;
                let callable = self.pop()?;
                self.push_call(callable, args)?;
            }
            NEWOBJ_EX => {
                let kwargs = self.pop()?;
                let args = self.pop()?;
                let callable = self.pop()?;
                if !matches!(&kwargs, Value::Dict(pairs) if pairs.is_empty()) {
                    return Err(PickleError::Invalid("keyword arguments are not supported".into()));
                }
                self.push_call(callable, args)?;
            }
            BUILD => {
                let state = self.pop()?;
                build(self.top_value_mut()?, state)?;
                self.sync_top();
            }

            PERSID | BINPERSID | EXT1 | EXT2 | EXT4 | INST | OBJ | NEXT_BUFFER => {
                return Err(PickleError::UnsupportedOpcode {
                    name: opcode_name(op),
                    offset: self.offset,
                });
            }
            _ => {
                return Err(PickleError::UnknownOpcode {
                    opcode: op,
                    offset: self.offset,
                });
            }
        }
        Ok(())
    }

    /// lowest stack index the current mark frame may pop
    fn floor(&self) -> usize {
        self.marks.last().copied().unwrap_or(0)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(Slot {
            value,
            memo_ids: vec![],
        });
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        if self.stack.len() <= self.floor() {
            return Err(PickleError::StackUnderflow(self.offset));
        }
        match self.stack.pop() {
            Some(slot) => Ok(slot.value),
            None => Err(PickleError::StackUnderflow(self.offset)),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(self.offset))?;
        Ok(self.stack.split_off(mark).into_iter().map(|slot| slot.value).collect())
    }

    fn top(&self) -> Result<&Slot, PickleError> {
        if self.stack.len() <= self.floor() {
            return Err(PickleError::StackUnderflow(self.offset));
        }
        self.stack.last().ok_or(PickleError::StackUnderflow(self.offset))
    }

    fn top_value_mut(&mut self) -> Result<&mut Value, PickleError> {
        if self.stack.len() <= self.floor() {
            return Err(PickleError::StackUnderflow(self.offset));
        }
        match self.stack.last_mut() {
            Some(slot) => Ok(&mut slot.value),
            None => Err(PickleError::StackUnderflow(self.offset)),
        }
    }

    /// copy the top of the stack back into the memo slots bound to it
    fn sync_top(&mut self) {
        if let Some(slot) = self.stack.last() {
            for id in &slot.memo_ids {
                self.memo.insert(*id, slot.value.clone());
            }
        }
    }

    fn extend_top(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        extend(self.top_value_mut()?, items)?;
        self.sync_top();
        Ok(())
    }

    fn memo_put(&mut self, id: u32) -> Result<(), PickleError> {
        if self.stack.len() <= self.floor() {
            return Err(PickleError::StackUnderflow(self.offset));
        }
        if let Some(slot) = self.stack.last_mut() {
            self.memo.insert(id, slot.value.clone());
            slot.memo_ids.push(id);
        }
        Ok(())
    }

    fn memo_get(&mut self, id: u32) -> Result<(), PickleError> {
        let value = self.memo.get(&id).cloned().ok_or(PickleError::MissingMemo(id))?;
        self.stack.push(Slot {
            value,
            memo_ids: vec![id],
        });
        Ok(())
    }

    fn push_call(&mut self, callable: Value, args: Value) -> Result<(), PickleError> {
        let global = match callable {
            Value::Global(global) => global,
            other => return Err(PickleError::Invalid(format!("cannot call a {}", other.type_name()))),
        };
        let value = call(global, args)?;
        self.push(value);
        Ok(())
    }

    fn push_bytes(&mut self, len: u64) -> Result<(), PickleError> {
        let bytes = self.read_bytes(len)?;
        self.push(Value::Bytes(bytes.into()));
        Ok(())
    }

    fn push_unicode(&mut self, len: u64) -> Result<(), PickleError> {
        let bytes = self.read_bytes(len)?;
        let text = String::from_utf8(bytes).map_err(|e| PickleError::Encoding(e.to_string()))?;
        self.push(Value::String(text));
        Ok(())
    }

    fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>, PickleError> {
        let mut buf = vec![];
        (&mut self.reader).take(len).read_to_end(&mut buf)?;
        if buf.len() as u64 != len {
            return Err(PickleError::UnexpectedEof);
        }
        Ok(buf)
    }

    fn read_i32_len(&mut self) -> Result<u64, PickleError> {
        let len = self.reader.read_i32::<LittleEndian>()?;
        u64::try_from(len).map_err(|_| PickleError::Invalid(format!("negative length {len}")))
    }

    /// a newline terminated argument, without the newline
    fn read_line(&mut self) -> Result<Vec<u8>, PickleError> {
        let mut line = vec![];
        self.reader.read_until(b'\n', &mut line)?;
        if line.pop() != Some(b'\n') {
            return Err(PickleError::UnexpectedEof);
        }
        Ok(line)
    }

    fn read_text_line(&mut self) -> Result<String, PickleError> {
        let line = self.read_line()?;
        String::from_utf8(line).map_err(|e| PickleError::Encoding(e.to_string()))
    }
}

fn resolve_global(module: String, name: String) -> Result<Global, PickleError> {
    match Global::resolve(&module, &name) {
        Some(global) => {
            trace!(%global, "resolved global");
            Ok(global)
        }
        None => Err(PickleError::UnsupportedGlobal { module, name }),
    }
}

fn extend(target: &mut Value, items: Vec<Value>) -> Result<(), PickleError> {
    match target {
        Value::List(list) => list.extend(items),
        Value::Set(set) => {
            for item in items {
                if !set.contains(&item) {
                    set.push(item);
                }
            }
        }
        other => return Err(PickleError::Invalid(format!("cannot append to {}", other.type_name()))),
    }
    Ok(())
}

fn insert_pairs(dict: &mut Value, items: Vec<Value>) -> Result<(), PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Invalid("odd number of dict items".into()));
    }
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        set_item(dict, key, value)?;
    }
    Ok(())
}

fn parse_int(digits: &str) -> Result<i64, PickleError> {
    digits.trim().parse::<i64>().map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow => PickleError::IntegerOverflow,
        _ => PickleError::Invalid(format!("bad integer literal {digits:?}")),
    })
}

/// little-endian two's complement, as written by LONG1 and LONG4
fn decode_long(bytes: &[u8]) -> Result<i64, PickleError> {
    if bytes.len() > 8 {
        return Err(PickleError::IntegerOverflow);
    }
    let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

/// undo python's repr() quoting of a protocol 0 STRING argument
fn unquote(line: &[u8]) -> Result<Vec<u8>, PickleError> {
    let inner = match line {
        [q @ (b'\'' | b'"'), inner @ .., last] if last == q => inner,
        _ => return Err(PickleError::Invalid("STRING argument is not quoted".into())),
    };

    let mut out = Vec::with_capacity(inner.len());
    let mut bytes = inner.iter().copied().peekable();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let Some(esc) = bytes.next() else {
            return Err(PickleError::Invalid("dangling escape in STRING".into()));
        };
        match esc {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'x' => {
                let hex = [bytes.next(), bytes.next()];
                let value = match hex {
                    [Some(h), Some(l)] => std::str::from_utf8(&[h, l])
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok()),
                    _ => None,
                };
                out.push(value.ok_or_else(|| PickleError::Invalid("bad \\x escape in STRING".into()))?);
            }
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                for _ in 0..2 {
                    match bytes.peek() {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            bytes.next();
                        }
                        _ => break,
                    }
                }
                out.push(value as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// decode python's raw-unicode-escape: latin-1 bytes plus \uXXXX and \UXXXXXXXX
fn raw_unicode_escape(line: &[u8]) -> Result<String, PickleError> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        let width = match (b, line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => {
                out.push(char::from(b));
                i += 1;
                continue;
            }
        };
        let hex = line
            .get(i + 2..i + 2 + width)
            .and_then(|h| std::str::from_utf8(h).ok())
            .ok_or_else(|| PickleError::Encoding("truncated \\u escape".into()))?;
        let c = u32::from_str_radix(hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| PickleError::Encoding(format!("bad escape \\u{hex}")))?;
        out.push(c);
        i += 2 + width;
    }
    Ok(out)
}

fn opcode_name(op: u8) -> &'static str {
    match op {
        PERSID => "PERSID",
        BINPERSID => "BINPERSID",
        EXT1 => "EXT1",
        EXT2 => "EXT2",
        EXT4 => "EXT4",
        INST => "INST",
        OBJ => "OBJ",
        NEXT_BUFFER => "NEXT_BUFFER",
        _ => "unknown",
    }
}
