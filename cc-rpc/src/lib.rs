//! CBOR-map typed accessor dispatcher for a channel's endpoint-0 "Command &
//! Control" interface, grounded on `services/nbus/cc-rpc.c`'s
//! `cc_rpc_process_request`.
//!
//! The wire format is one CBOR map per request: each key names a registered
//! accessor, each value is either `null` (read) or a typed value (write).
//! The response mirrors the processed keys (unknown keys are skipped
//! silently) with each value being the accessor's state *after* the
//! request — a write is always followed by a read of the same accessor, so
//! a write response is never just an acknowledgement.
#![cfg_attr(not(test), no_std)]

use minicbor::encode::Write as CborWrite;
use minicbor::{Decoder, Encoder};

/// Request and response buffers are bounded to this many bytes (spec.md
/// §6's `CBOR_RPC_REQ_SIZE`/`CBOR_RPC_RESP_SIZE`); a larger request fails
/// the whole map rather than being partially processed.
pub const CBOR_RPC_REQ_SIZE: usize = 256;
pub const CBOR_RPC_RESP_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// `request` exceeds [`CBOR_RPC_REQ_SIZE`].
    TooBig,
    /// The request was not a well-formed CBOR map of string keys.
    Decode,
    /// The response did not fit in the caller's buffer.
    Encode,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooBig => write!(f, "cc-rpc: request exceeds buffer size"),
            Error::Decode => write!(f, "cc-rpc: malformed request map"),
            Error::Encode => write!(f, "cc-rpc: response buffer too small"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// What kind of value an accessor reads and writes. Determines how
/// [`dispatch`] interprets the request value and encodes the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Int,
    Bool,
    /// No value; any request value (including `null`) just triggers
    /// [`Accessor::call`]. The response is always `null`.
    Function,
}

/// One registered named accessor. Implementors override only the read/write
/// methods relevant to their [`Accessor::kind`]; the defaults report
/// failure, which `dispatch` turns into a `null` response entry.
pub trait Accessor {
    fn name(&self) -> &str;
    fn kind(&self) -> Kind;

    fn read_string(&mut self, out: &mut [u8]) -> Option<usize> {
        let _ = out;
        None
    }
    fn write_string(&mut self, value: &str) -> bool {
        let _ = value;
        false
    }
    fn read_int(&mut self) -> Option<i32> {
        None
    }
    fn write_int(&mut self, value: i32) -> bool {
        let _ = value;
        false
    }
    fn read_bool(&mut self) -> Option<bool> {
        None
    }
    fn write_bool(&mut self, value: bool) -> bool {
        let _ = value;
        false
    }
    /// Invoked for `Kind::Function` accessors; `true` on success.
    fn call(&mut self) -> bool {
        false
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        SliceWriter { buf, pos: 0 }
    }

    fn len(&self) -> usize {
        self.pos
    }
}

impl<'a> CborWrite for SliceWriter<'a> {
    type Error = Error;

    fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if self.pos + data.len() > self.buf.len() {
            return Err(Error::Encode);
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classified {
    Null,
    Bool,
    Int,
    Str,
    Other,
}

fn classify(dec: &Decoder) -> Classified {
    if dec.clone().null().is_ok() {
        Classified::Null
    } else if dec.clone().bool().is_ok() {
        Classified::Bool
    } else if dec.clone().i32().is_ok() {
        Classified::Int
    } else if dec.clone().str().is_ok() {
        Classified::Str
    } else {
        Classified::Other
    }
}

/// Consume exactly one CBOR value from `dec` (whatever `classify` already
/// determined it to be) and apply it to `acc` if the types are compatible.
/// Returns whether the write succeeded (a bare `null` request counts as a
/// trivially successful "no write requested").
fn apply_value(acc: &mut dyn Accessor, dec: &mut Decoder, classified: Classified) -> bool {
    match (acc.kind(), classified) {
        (_, Classified::Null) => {
            let _ = dec.null();
            true
        }
        (Kind::String, Classified::Str) => match dec.str() {
            Ok(s) => acc.write_string(s),
            Err(_) => false,
        },
        (Kind::Int, Classified::Int) => match dec.i32() {
            Ok(v) => acc.write_int(v),
            Err(_) => false,
        },
        (Kind::Bool, Classified::Bool) => match dec.bool() {
            Ok(v) => acc.write_bool(v),
            Err(_) => false,
        },
        (Kind::Function, _) => {
            let _ = dec.skip();
            acc.call()
        }
        (_, _) => {
            let _ = dec.skip();
            false
        }
    }
}

fn encode_read(acc: &mut dyn Accessor, enc: &mut Encoder<SliceWriter>) -> Result<(), Error> {
    match acc.kind() {
        Kind::String => {
            let mut buf = [0u8; 256];
            match acc.read_string(&mut buf) {
                Some(n) => {
                    let s = core::str::from_utf8(&buf[..n]).map_err(|_| Error::Encode)?;
                    enc.str(s).map_err(|_| Error::Encode)?;
                }
                None => {
                    enc.null().map_err(|_| Error::Encode)?;
                }
            }
        }
        Kind::Int => match acc.read_int() {
            Some(v) => {
                enc.i32(v).map_err(|_| Error::Encode)?;
            }
            None => {
                enc.null().map_err(|_| Error::Encode)?;
            }
        },
        Kind::Bool => match acc.read_bool() {
            Some(v) => {
                enc.bool(v).map_err(|_| Error::Encode)?;
            }
            None => {
                enc.null().map_err(|_| Error::Encode)?;
            }
        },
        Kind::Function => {
            enc.null().map_err(|_| Error::Encode)?;
        }
    }
    Ok(())
}

/// Process a CBOR-map request against `accessors`, writing the CBOR-map
/// response into `response_out` and returning its length.
pub fn dispatch(accessors: &mut [&mut dyn Accessor], request: &[u8], response_out: &mut [u8]) -> Result<usize, Error> {
    if request.len() > CBOR_RPC_REQ_SIZE {
        return Err(Error::TooBig);
    }

    // Pass 1: count entries that will appear in the response (known keys
    // only — unknown keys are skipped silently and never emitted).
    let mut count: u64 = 0;
    {
        let mut dec = Decoder::new(request);
        let len = dec.map().map_err(|_| Error::Decode)?.ok_or(Error::Decode)?;
        for _ in 0..len {
            let key = dec.str().map_err(|_| Error::Decode)?;
            dec.skip().map_err(|_| Error::Decode)?;
            if accessors.iter().any(|a| a.name() == key) {
                count += 1;
            }
        }
    }

    let mut writer = SliceWriter::new(response_out);
    let mut enc = Encoder::new(writer);
    enc.map(count).map_err(|_| Error::Encode)?;

    let mut dec = Decoder::new(request);
    let len = dec.map().map_err(|_| Error::Decode)?.ok_or(Error::Decode)?;
    for _ in 0..len {
        let key = dec.str().map_err(|_| Error::Decode)?;
        let classified = classify(&dec);
        match accessors.iter_mut().find(|a| a.name() == key) {
            None => {
                let _ = dec.skip();
            }
            Some(acc) => {
                enc.str(key).map_err(|_| Error::Encode)?;
                let wrote_ok = apply_value(&mut **acc, &mut dec, classified);
                if wrote_ok {
                    encode_read(&mut **acc, &mut enc)?;
                } else {
                    enc.null().map_err(|_| Error::Encode)?;
                }
            }
        }
    }

    writer = enc.into_writer();
    Ok(writer.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NameAccessor {
        value: heapless::String<64>,
    }

    impl Accessor for NameAccessor {
        fn name(&self) -> &str {
            "name"
        }
        fn kind(&self) -> Kind {
            Kind::String
        }
        fn read_string(&mut self, out: &mut [u8]) -> Option<usize> {
            let bytes = self.value.as_bytes();
            if bytes.len() > out.len() {
                return None;
            }
            out[..bytes.len()].copy_from_slice(bytes);
            Some(bytes.len())
        }
        fn write_string(&mut self, value: &str) -> bool {
            self.value = heapless::String::try_from(value).unwrap_or_default();
            true
        }
    }

    struct CounterAccessor {
        value: i32,
    }

    impl Accessor for CounterAccessor {
        fn name(&self) -> &str {
            "counter"
        }
        fn kind(&self) -> Kind {
            Kind::Int
        }
        fn read_int(&mut self) -> Option<i32> {
            Some(self.value)
        }
        fn write_int(&mut self, value: i32) -> bool {
            self.value = value;
            true
        }
    }

    struct CallCountAccessor {
        calls: u32,
    }

    impl Accessor for CallCountAccessor {
        fn name(&self) -> &str {
            "reset"
        }
        fn kind(&self) -> Kind {
            Kind::Function
        }
        fn call(&mut self) -> bool {
            self.calls += 1;
            true
        }
    }

    #[test]
    fn read_request_returns_current_value() {
        let mut name = NameAccessor { value: heapless::String::try_from("root").unwrap() };
        let mut accessors: [&mut dyn Accessor; 1] = [&mut name];

        let mut req = [0u8; 64];
        let mut req_writer = SliceWriter::new(&mut req);
        {
            let mut enc = Encoder::new(&mut req_writer);
            enc.map(1).unwrap();
            enc.str("name").unwrap();
            enc.null().unwrap();
        }
        let req_len = req_writer.len();

        let mut resp = [0u8; 64];
        let n = dispatch(&mut accessors, &req[..req_len], &mut resp).unwrap();

        let mut dec = Decoder::new(&resp[..n]);
        assert_eq!(dec.map().unwrap(), Some(1));
        assert_eq!(dec.str().unwrap(), "name");
        assert_eq!(dec.str().unwrap(), "root");
    }

    #[test]
    fn write_then_read_reflects_new_value() {
        let mut counter = CounterAccessor { value: 0 };
        let mut accessors: [&mut dyn Accessor; 1] = [&mut counter];

        let mut req = [0u8; 64];
        let mut req_writer = SliceWriter::new(&mut req);
        {
            let mut enc = Encoder::new(&mut req_writer);
            enc.map(1).unwrap();
            enc.str("counter").unwrap();
            enc.i32(42).unwrap();
        }
        let req_len = req_writer.len();

        let mut resp = [0u8; 64];
        let n = dispatch(&mut accessors, &req[..req_len], &mut resp).unwrap();
        let mut dec = Decoder::new(&resp[..n]);
        dec.map().unwrap();
        assert_eq!(dec.str().unwrap(), "counter");
        assert_eq!(dec.i32().unwrap(), 42);
    }

    #[test]
    fn unknown_keys_are_skipped_silently() {
        let mut counter = CounterAccessor { value: 5 };
        let mut accessors: [&mut dyn Accessor; 1] = [&mut counter];

        let mut req = [0u8; 64];
        let mut req_writer = SliceWriter::new(&mut req);
        {
            let mut enc = Encoder::new(&mut req_writer);
            enc.map(2).unwrap();
            enc.str("bogus").unwrap();
            enc.null().unwrap();
            enc.str("counter").unwrap();
            enc.null().unwrap();
        }
        let req_len = req_writer.len();

        let mut resp = [0u8; 64];
        let n = dispatch(&mut accessors, &req[..req_len], &mut resp).unwrap();
        let mut dec = Decoder::new(&resp[..n]);
        assert_eq!(dec.map().unwrap(), Some(1));
        assert_eq!(dec.str().unwrap(), "counter");
        assert_eq!(dec.i32().unwrap(), 5);
    }

    #[test]
    fn type_mismatch_is_malformed_and_encodes_null() {
        let mut counter = CounterAccessor { value: 5 };
        let mut accessors: [&mut dyn Accessor; 1] = [&mut counter];

        let mut req = [0u8; 64];
        let mut req_writer = SliceWriter::new(&mut req);
        {
            let mut enc = Encoder::new(&mut req_writer);
            enc.map(1).unwrap();
            enc.str("counter").unwrap();
            enc.str("not an int").unwrap();
        }
        let req_len = req_writer.len();

        let mut resp = [0u8; 64];
        let n = dispatch(&mut accessors, &req[..req_len], &mut resp).unwrap();
        let mut dec = Decoder::new(&resp[..n]);
        dec.map().unwrap();
        assert_eq!(dec.str().unwrap(), "counter");
        assert!(dec.null().is_ok());
    }

    #[test]
    fn function_accessor_calls_and_responds_null() {
        let mut reset = CallCountAccessor { calls: 0 };
        let mut accessors: [&mut dyn Accessor; 1] = [&mut reset];

        let mut req = [0u8; 64];
        let mut req_writer = SliceWriter::new(&mut req);
        {
            let mut enc = Encoder::new(&mut req_writer);
            enc.map(1).unwrap();
            enc.str("reset").unwrap();
            enc.null().unwrap();
        }
        let req_len = req_writer.len();

        let mut resp = [0u8; 64];
        let n = dispatch(&mut accessors, &req[..req_len], &mut resp).unwrap();
        let mut dec = Decoder::new(&resp[..n]);
        dec.map().unwrap();
        assert_eq!(dec.str().unwrap(), "reset");
        assert!(dec.null().is_ok());
        assert_eq!(accessors[0].kind(), Kind::Function);
    }
}
