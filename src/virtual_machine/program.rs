//! Program container and loader.
//!
//! A [`Program`] bundles the machine sizing it expects, a constant pool
//! copied into the first global registers at load time, and a validated
//! instruction stream. Programs are stored as
//! `MAGIC | version | header | constants | instructions`, all little-endian.

use crate::types::encoding::{Decode, Encode};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Instruction, MODE_BITS, Op};
use crate::virtual_machine::vm::{MachineConfig, Register};
use scopevm_derive::BinaryCodec;
use std::fmt::Write;
use std::path::Path;

/// Magic bytes identifying a serialized program.
const MAGIC: &[u8; 4] = b"SCVM";

/// Current program format version.
const CURRENT_VERSION: Version = Version::new(1, 0, 0);

/// Semantic version for program format compatibility.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, BinaryCodec)]
struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

impl Version {
    const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Number of instructions up to and including the first `ABORT 0`, or
/// `None` when the stream has no sentinel.
pub fn count_instructions(instructions: &[Instruction]) -> Option<usize> {
    instructions
        .iter()
        .position(Instruction::is_sentinel)
        .map(|index| index + 1)
}

/// Checks that a stream can be handed to the dispatcher.
///
/// The stream must end with the sentinel, every opcode must decode, and
/// every `JUMP`, `JUMP_CHECK` and `LABEL` target must lie inside the stream.
pub fn validate(instructions: &[Instruction]) -> Result<(), VMError> {
    if !instructions.last().is_some_and(Instruction::is_sentinel) {
        return Err(VMError::MissingSentinel);
    }

    for (index, ins) in instructions.iter().enumerate() {
        let raw = ins.op.raw();
        let op = Op::try_from(raw >> MODE_BITS).map_err(|_| VMError::InvalidOpcode { opcode: raw, index })?;
        if ins.op.decode().is_err() {
            return Err(VMError::InvalidAddressing {
                mnemonic: op.mnemonic(),
                index,
            });
        }

        let target = match op {
            Op::Jump => Some(ins.a),
            Op::JumpCheck | Op::Label => Some(ins.b),
            _ => None,
        };
        if let Some(target) = target
            && target as usize >= instructions.len()
        {
            return Err(VMError::InvalidJumpTarget { target, index });
        }
    }
    Ok(())
}

/// Constant pool entry.
#[derive(Debug, Clone, Copy, PartialEq, BinaryCodec)]
pub enum Constant {
    Long(i64),
    Float(f64),
    Char(char),
    Bool(bool),
}

impl From<Constant> for Register {
    fn from(constant: Constant) -> Self {
        match constant {
            Constant::Long(v) => Register::Long(v),
            Constant::Float(v) => Register::Float(v),
            Constant::Char(v) => Register::Char(v),
            Constant::Bool(v) => Register::Bool(v),
        }
    }
}

/// Machine sizing requested by a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub struct ProgramHeader {
    pub stack_size: u32,
    pub frame_limit: u32,
    pub global_count: u32,
}

impl Default for ProgramHeader {
    fn default() -> Self {
        let config = MachineConfig::default();
        Self {
            stack_size: config.stack_size as u32,
            frame_limit: config.frame_limit as u32,
            global_count: config.global_count as u32,
        }
    }
}

impl ProgramHeader {
    /// Machine configuration for this header, heap limits left at their defaults.
    pub fn config(&self) -> MachineConfig {
        MachineConfig {
            stack_size: self.stack_size as usize,
            frame_limit: self.frame_limit as usize,
            global_count: self.global_count as usize,
            ..MachineConfig::default()
        }
    }
}

/// Validated program ready to load into a machine.
#[derive(Debug, Clone, PartialEq, BinaryCodec)]
pub struct Program {
    header: ProgramHeader,
    constants: Vec<Constant>,
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(
        header: ProgramHeader,
        constants: Vec<Constant>,
        instructions: Vec<Instruction>,
    ) -> Result<Self, VMError> {
        validate(&instructions)?;
        if constants.len() > header.global_count as usize {
            return Err(VMError::InvalidConfig {
                reason: "constant pool exceeds the global region",
            });
        }
        Ok(Self {
            header,
            constants,
            instructions,
        })
    }

    /// Program with the default header and no constants.
    pub fn from_instructions(instructions: Vec<Instruction>) -> Result<Self, VMError> {
        Self::new(ProgramHeader::default(), Vec::new(), instructions)
    }

    pub fn header(&self) -> &ProgramHeader {
        &self.header
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Serializes the program to its portable binary format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        MAGIC.encode(&mut out);
        CURRENT_VERSION.encode(&mut out);
        self.encode(&mut out);
        out
    }

    /// Deserializes and validates a program.
    ///
    /// Rejects a wrong magic, any other format version, and trailing bytes.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, VMError> {
        if input.len() < MAGIC.len() {
            return Err(VMError::DecodeError {
                reason: "truncated".to_string(),
            });
        }

        if &<[u8; 4]>::decode(&mut input)? != MAGIC {
            return Err(VMError::DecodeError {
                reason: "bad magic".to_string(),
            });
        }

        if Version::decode(&mut input)? != CURRENT_VERSION {
            return Err(VMError::DecodeError {
                reason: "unsupported version".to_string(),
            });
        }

        let p = Program::decode(&mut input)?;
        if !input.is_empty() {
            return Err(VMError::DecodeError {
                reason: "trailing bytes".to_string(),
            });
        }
        Program::new(p.header, p.constants, p.instructions)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VMError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes()).map_err(|e| VMError::IoError {
            path: path.display().to_string(),
            source: e.to_string(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, VMError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| VMError::IoError {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Renders the program as assembler-compatible text.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, ".stack {}", self.header.stack_size);
        let _ = writeln!(out, ".frames {}", self.header.frame_limit);
        let _ = writeln!(out, ".globals {}", self.header.global_count);
        for constant in &self.constants {
            let _ = match constant {
                Constant::Long(v) => writeln!(out, ".const long {v}"),
                Constant::Float(v) => writeln!(out, ".const float {v:?}"),
                Constant::Char(v) => writeln!(out, ".const char {}", *v as u32),
                Constant::Bool(v) => writeln!(out, ".const bool {v}"),
            };
        }
        for (index, ins) in self.instructions.iter().enumerate() {
            let _ = writeln!(out, "{ins}    # {index}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::errors::ErrorKind;
    use crate::virtual_machine::isa::Opcode;

    fn set_long(dst: u16, value: i16) -> Instruction {
        Instruction::new(Opcode::new(Op::Set, 0), dst, value as u16, 0)
    }

    fn sample() -> Program {
        Program::new(
            ProgramHeader {
                stack_size: 64,
                frame_limit: 8,
                global_count: 4,
            },
            vec![Constant::Long(-7), Constant::Float(2.5), Constant::Char('λ')],
            vec![set_long(0, 42), Instruction::SENTINEL],
        )
        .unwrap()
    }

    #[test]
    fn count_stops_at_sentinel() {
        let stream = [set_long(0, 1), Instruction::SENTINEL, set_long(1, 2)];
        assert_eq!(count_instructions(&stream), Some(2));
        assert_eq!(count_instructions(&stream[..1]), None);
        assert_eq!(count_instructions(&[]), None);
    }

    #[test]
    fn abort_with_code_is_not_a_sentinel() {
        let stream = [Instruction::abort(ErrorKind::Abort)];
        assert_eq!(count_instructions(&stream), None);
        assert!(matches!(validate(&stream), Err(VMError::MissingSentinel)));
    }

    #[test]
    fn validate_rejects_bad_opcodes() {
        let bad = Instruction::new(Opcode::from_raw(0x3F << MODE_BITS), 0, 0, 0);
        assert!(matches!(
            validate(&[bad, Instruction::SENTINEL]),
            Err(VMError::InvalidOpcode { index: 0, .. })
        ));

        // SET has no register slot that may be global.
        let global_set = Instruction::new(Opcode::new(Op::Set, 0b001), 0, 0, 0);
        assert!(matches!(
            validate(&[Instruction::SENTINEL, global_set, Instruction::SENTINEL]),
            Err(VMError::InvalidAddressing {
                mnemonic: "SET",
                index: 1
            })
        ));
    }

    #[test]
    fn validate_rejects_jump_out_of_stream() {
        let jump = Instruction::new(Opcode::new(Op::Jump, 0), 2, 0, 0);
        assert!(matches!(
            validate(&[jump, Instruction::SENTINEL]),
            Err(VMError::InvalidJumpTarget { target: 2, index: 0 })
        ));
        let jump = Instruction::new(Opcode::new(Op::Jump, 0), 1, 0, 0);
        assert!(validate(&[jump, Instruction::SENTINEL]).is_ok());
    }

    #[test]
    fn bytes_round_trip() {
        let program = sample();
        let bytes = program.to_bytes();
        assert_eq!(&bytes[..4], b"SCVM");
        assert_eq!(Program::from_bytes(&bytes).unwrap(), program);
    }

    #[test]
    fn from_bytes_rejects_corruption() {
        let bytes = sample().to_bytes();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Program::from_bytes(&bad_magic),
            Err(VMError::DecodeError { .. })
        ));

        let mut bad_version = bytes.clone();
        bad_version[4] = 9;
        assert!(Program::from_bytes(&bad_version).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(Program::from_bytes(&trailing).is_err());

        assert!(Program::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Program::from_bytes(b"SC").is_err());
    }

    #[test]
    fn too_many_constants_is_rejected() {
        let header = ProgramHeader {
            global_count: 1,
            ..ProgramHeader::default()
        };
        let result = Program::new(
            header,
            vec![Constant::Bool(true), Constant::Bool(false)],
            vec![Instruction::SENTINEL],
        );
        assert!(matches!(result, Err(VMError::InvalidConfig { .. })));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let program = sample();
        program.save(&path).unwrap();
        assert_eq!(Program::load(&path).unwrap(), program);

        let missing = dir.path().join("missing.bin");
        let err = Program::load(&missing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotOpenFile);
    }

    #[test]
    fn disassembly_lists_every_instruction() {
        let text = sample().disassemble();
        assert!(text.contains(".globals 4"));
        assert!(text.contains(".const long -7"));
        assert!(text.contains(".const float 2.5"));
        assert!(text.contains("SET_L 0, 42, 0    # 0"));
        assert!(text.contains("ABORT 0    # 1"));
    }

    #[test]
    fn header_maps_to_config() {
        let config = sample().header().config();
        assert_eq!(config.stack_size, 64);
        assert_eq!(config.frame_limit, 8);
        assert_eq!(config.global_count, 4);
        assert_eq!(config.heap_limit, MachineConfig::default().heap_limit);
    }
}
