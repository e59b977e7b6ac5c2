//! Bytecode deserialization, grounded in `core.c`'s `verify_header`,
//! `read_string`, `read_prototype` and `su_load`.

use std::io::Read;

use su_core::{Constant, Instruction, LoaderError, LoaderResult, OpCode, ProtoId, Prototype, UpvalDesc};
use tracing::{debug, warn};

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 0;
pub const MAGIC: [u8; 4] = [0x1b, b's', b'u', b'c'];

/// A pull-style byte source over the compiled program stream. Implemented
/// for anything that is `std::io::Read`; kept as its own trait (rather than
/// depending on `Read` directly everywhere) so callers in `su-cli` can load
/// from a file, an embedded byte slice, or a future streaming transport the
/// same way the original's `su_reader` callback did.
pub trait ByteSource {
    fn pull(&mut self, buf: &mut [u8]) -> LoaderResult<()>;
}

impl<R: Read> ByteSource for R {
    fn pull(&mut self, buf: &mut [u8]) -> LoaderResult<()> {
        self.read_exact(buf).map_err(|_| LoaderError::UnexpectedEof)
    }
}

struct Framer<'a> {
    src: &'a mut dyn ByteSource,
}

impl<'a> Framer<'a> {
    fn new(src: &'a mut dyn ByteSource) -> Self {
        Framer { src }
    }

    fn bytes(&mut self, n: usize) -> LoaderResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.src.pull(&mut buf)?;
        Ok(buf)
    }

    fn u8(&mut self) -> LoaderResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> LoaderResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> LoaderResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> LoaderResult<f64> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Reads a length-prefixed byte string. The prefix counts the trailing
    /// NUL the writer includes, matching `read_string`'s `size` field.
    fn length_prefixed_string(&mut self) -> LoaderResult<Vec<u8>> {
        let size = self.u32()? as usize;
        self.bytes(size)
    }
}

fn verify_header(f: &mut Framer) -> LoaderResult<()> {
    let sig = f.bytes(4)?;
    if sig != MAGIC {
        warn!(?sig, "rejecting program with bad signature");
        return Err(LoaderError::BadSignature);
    }
    let major = f.u8()?;
    let minor = f.u8()?;
    // The original checks `version[0] != MAJOR && version[1] != MINOR`,
    // which accepts a mismatched major as long as the minor happens to
    // differ too (true de Morgan's-law inversion of the intended check).
    // Fixed here to reject any mismatch on either field.
    if major != VERSION_MAJOR || minor != VERSION_MINOR {
        warn!(major, minor, "rejecting program with unsupported version");
        return Err(LoaderError::UnsupportedVersion { major, minor });
    }
    let flags = f.u16()?;
    if flags != 0 {
        warn!(flags, "rejecting program with unknown flags set");
        return Err(LoaderError::BadFlags(flags));
    }
    Ok(())
}

fn read_instruction(f: &mut Framer) -> LoaderResult<Instruction> {
    let op_byte = f.u8()?;
    let a = f.u8()?;
    let b = f.u16()? as i16;
    let op = OpCode::from_u8(op_byte).ok_or(LoaderError::BadOpcode(op_byte))?;
    Ok(Instruction { op, a, b })
}

fn read_constant(f: &mut Framer) -> LoaderResult<Constant> {
    let tag = f.u8()?;
    match tag {
        0 => Ok(Constant::Str(f.length_prefixed_string()?)),
        1 => Ok(Constant::Number(f.f64()?)),
        2 => Ok(Constant::True),
        3 => Ok(Constant::False),
        4 => Ok(Constant::Nil),
        other => Err(LoaderError::BadConstantTag(other)),
    }
}

fn read_upvalue(f: &mut Framer) -> LoaderResult<UpvalDesc> {
    Ok(UpvalDesc {
        level: f.u16()?,
        index: f.u16()?,
    })
}

/// Recursively decodes one prototype and its nested prototypes, inserting
/// each into `prototypes` as it completes (post-order, matching the
/// original's recursive `read_prototype`, but returning arena ids instead
/// of growing an owned tree so sibling/parent prototypes can share
/// children -- see `proto.rs`'s sharing rationale).
fn read_prototype(
    f: &mut Framer,
    prototypes: &mut su_core::Arena<Prototype>,
) -> LoaderResult<ProtoId> {
    let num_inst = f.u32()? as usize;
    let mut instructions = Vec::with_capacity(num_inst);
    for _ in 0..num_inst {
        instructions.push(read_instruction(f)?);
    }

    let num_const = f.u32()? as usize;
    let mut constants = Vec::with_capacity(num_const);
    for _ in 0..num_const {
        constants.push(read_constant(f)?);
    }

    let num_ups = f.u32()? as usize;
    let mut upvalues = Vec::with_capacity(num_ups);
    for _ in 0..num_ups {
        upvalues.push(read_upvalue(f)?);
    }

    let num_prot = f.u32()? as usize;
    let mut sub_prototypes = Vec::with_capacity(num_prot);
    for _ in 0..num_prot {
        sub_prototypes.push(read_prototype(f, prototypes)?);
    }

    let name = f.length_prefixed_string()?;

    let num_lineinf = f.u32()? as usize;
    let mut line_info = Vec::with_capacity(num_lineinf);
    for _ in 0..num_lineinf {
        line_info.push(f.u32()?);
    }

    Ok(prototypes.insert(Prototype {
        instructions,
        constants,
        upvalues,
        sub_prototypes,
        name,
        line_info,
    }))
}

/// Loads one compiled program: a header followed by one root prototype
/// (which may itself contain nested prototypes for every `LAMBDA` site).
/// Matches `su_load`, minus the final `lambda()` call -- instantiating the
/// loaded prototype into a closure is the caller's job (`State::load_root`),
/// since that step needs the full embedding state, not just the heap.
pub fn load(
    src: &mut dyn ByteSource,
    prototypes: &mut su_core::Arena<Prototype>,
) -> LoaderResult<ProtoId> {
    let mut f = Framer::new(src);
    verify_header(&mut f)?;
    let root = read_prototype(&mut f, prototypes)?;
    debug!("loaded program, root prototype id {:?}", root);
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use su_core::Arena;

    fn encode_minimal_program() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION_MAJOR);
        buf.push(VERSION_MINOR);
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags

        // One prototype: a single RETURN instruction, no constants/upvalues/
        // nested prototypes, an empty name, no line info.
        buf.extend_from_slice(&1u32.to_le_bytes()); // num_inst
        buf.push(OpCode::Return as u8);
        buf.push(0); // a
        buf.extend_from_slice(&0u16.to_le_bytes()); // b

        buf.extend_from_slice(&0u32.to_le_bytes()); // num_const
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_ups
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_prot
        buf.extend_from_slice(&0u32.to_le_bytes()); // name length
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_lineinf
        buf
    }

    #[test]
    fn loads_minimal_program() {
        let bytes = encode_minimal_program();
        let mut cursor = std::io::Cursor::new(bytes);
        let mut prototypes = Arena::new();
        let root = load(&mut cursor, &mut prototypes).unwrap();
        let proto = prototypes.get(root).unwrap();
        assert_eq!(proto.instructions.len(), 1);
        assert_eq!(proto.instructions[0].op, OpCode::Return);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = encode_minimal_program();
        bytes[0] = 0x00;
        let mut cursor = std::io::Cursor::new(bytes);
        let mut prototypes = Arena::new();
        assert_eq!(
            load(&mut cursor, &mut prototypes).unwrap_err(),
            LoaderError::BadSignature
        );
    }

    /// `fn() { if true { return 1 } return 0 }`, hand-encoded on the wire
    /// so `TEST`'s branch target comes from a real `read_instruction` call
    /// rather than a test helper's `a`/`b` convention -- this is the case
    /// `interp.rs`'s own `TEST`/`JMP` unit tests can't catch, since they
    /// build `Instruction` values directly with the same convention the
    /// dispatch loop consumes.
    fn encode_branch_program() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION_MAJOR);
        buf.push(VERSION_MINOR);
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags

        buf.extend_from_slice(&6u32.to_le_bytes()); // num_inst
        let mut instr = |op: OpCode, a: u8| {
            buf.push(op as u8);
            buf.push(a);
            buf.extend_from_slice(&0u16.to_le_bytes()); // b, unused here
        };
        instr(OpCode::Push, 0); // 0: push constants[0] = true
        instr(OpCode::Test, 4); // 1: jump to 4 if truthy
        instr(OpCode::Push, 1); // 2: push constants[1] = 0.0
        instr(OpCode::Return, 0); // 3
        instr(OpCode::Push, 2); // 4: push constants[2] = 1.0
        instr(OpCode::Return, 0); // 5

        buf.extend_from_slice(&3u32.to_le_bytes()); // num_const
        buf.push(2); // True
        buf.push(1); // Number
        buf.extend_from_slice(&0.0f64.to_le_bytes());
        buf.push(1); // Number
        buf.extend_from_slice(&1.0f64.to_le_bytes());

        buf.extend_from_slice(&0u32.to_le_bytes()); // num_ups
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_prot
        buf.extend_from_slice(&0u32.to_le_bytes()); // name length
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_lineinf
        buf
    }

    #[test]
    fn loaded_test_branch_jumps_to_the_a_encoded_target() {
        use crate::State;

        let bytes = encode_branch_program();
        let mut cursor = std::io::Cursor::new(bytes);
        let mut prototypes = Arena::new();
        let root = load(&mut cursor, &mut prototypes).unwrap();

        let mut s = State::new();
        s.heap.prototypes = prototypes;
        s.load_root(root).unwrap();
        let closure_id = match s.get(-1).unwrap() {
            su_core::Value::Function(id) => id,
            other => panic!("expected a closure, got {other:?}"),
        };
        s.pop_n(1).unwrap();
        let result = s.run_program(closure_id, vec![]).unwrap();
        assert_eq!(result, su_core::Value::Number(1.0));
    }

    #[test]
    fn rejects_mismatched_version() {
        let mut bytes = encode_minimal_program();
        bytes[4] = VERSION_MAJOR + 1;
        let mut cursor = std::io::Cursor::new(bytes);
        let mut prototypes = Arena::new();
        assert!(matches!(
            load(&mut cursor, &mut prototypes).unwrap_err(),
            LoaderError::UnsupportedVersion { .. }
        ));
    }
}
