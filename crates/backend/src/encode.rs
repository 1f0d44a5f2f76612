//! The portable fixed-width encoding.
//!
//! Concrete x86/x64 instruction encoders live outside this tree; this
//! backend lowers the IR to a deterministic portable form exercising the
//! frozen backend interface: the executable image is the encoded
//! instructions followed by the NUL-terminated constant strings, the
//! global region is allocated by the loader, and export/import/debug
//! tables use the documented layouts.
//!
//! Every instruction encodes as an 8-byte header, an optional 8-byte
//! little-endian immediate, and an optional payload:
//!
//! ```text
//! u16 opcode | u8 r1 | u8 r2 | u8 r3 | u8 flags | u16 payload-len
//! [ i64 imm ] [ payload bytes ]
//! ```
//!
//! Immediate linkage resolves per the operand's meaning: PC-relative
//! branch targets and `afip` addresses become offsets from the
//! instruction's own image offset; absolute forms, the global-region and
//! string-region bases become image addresses (the image loads at
//! address 0, with the global region placed right after it).
//!
//! A `binsz` hint pads the encoded form to the requested size with whole
//! NOP encodings.

use rustc_hash::FxHashMap;

use lyrical_codegen::backend::{append_table_entry, BackendResult, CompileResult};
use lyrical_codegen::ir::{Func, Imm, ImmTerm, Inst, Opcode, Payload};
use lyrical_codegen::RegionAlignment;

use crate::dbginfo;

/// Flag bits of the encoded header.
pub const FLAG_IMM: u8 = 1;
pub const FLAG_PAYLOAD: u8 = 1 << 1;

/// Byte size of an encoded NOP, the padding unit.
pub const NOP_SIZE: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("register id {0} does not fit the encoding")]
    RegisterTooLarge(u32),
    #[error("payload of {0} bytes does not fit the encoding")]
    PayloadTooLarge(usize),
    #[error("binsz hint {hint} is smaller than the encoded size {need}")]
    BinszTooSmall { hint: u32, need: u32 },
    #[error("binsz hint {0} is not a multiple of the NOP size")]
    BinszNotNopMultiple(u32),
}

struct InstSlot {
    func: Func,
    inst: Inst,
    offset: u32,
    size: u32,
}

/// Lower a compilation result to the portable encoding.
pub fn encode(
    result: &CompileResult,
    alignment: RegionAlignment,
    sizeof_gpr: u32,
    with_dbg: bool,
) -> Result<BackendResult, EncodeError> {
    let prog = &result.program;

    // Layout pass: sizes and offsets for every encoded instruction.
    let mut slots: Vec<InstSlot> = Vec::new();
    let mut func_offsets: FxHashMap<Func, u32> = FxHashMap::default();
    let mut inst_offsets: FxHashMap<(Func, Inst), u32> = FxHashMap::default();
    let mut offset = 0u32;
    for f in prog.iter() {
        func_offsets.insert(f, offset);
        let data = prog.func(f);
        for i in data.iter() {
            let inst = data.inst(i);
            if inst.opcode == Opcode::Comment {
                continue;
            }
            let size = encoded_size(inst)?;
            inst_offsets.insert((f, i), offset);
            slots.push(InstSlot {
                func: f,
                inst: i,
                offset,
                size,
            });
            offset += size;
        }
    }
    let instr_size = offset;

    let region_align = match alignment {
        RegionAlignment::Compact => 4,
        RegionAlignment::CompactPageAligned | RegionAlignment::PageAligned => 4096,
    };
    let strings_base = instr_size.next_multiple_of(region_align);
    let strings_size = result.string_region.len() as u32;
    let global_base = (strings_base + strings_size).next_multiple_of(region_align);

    // Emission pass.
    let mut exec = Vec::with_capacity(strings_base as usize + result.string_region.len());
    let mut dbg_entries: Vec<dbginfo::Entry> = Vec::new();
    for slot in &slots {
        let data = prog.func(slot.func);
        let inst = data.inst(slot.inst);
        debug_assert_eq!(exec.len() as u32, slot.offset);
        let imm = inst.imm.as_ref().map(|imm| {
            resolve_imm(
                imm,
                inst.opcode,
                slot,
                &func_offsets,
                &inst_offsets,
                global_base,
                strings_base,
            )
        });
        emit_one(&mut exec, inst, imm, slot.size)?;
        if with_dbg {
            if let Some(path) = &inst.dbg.filepath {
                dbg_entries.push(dbginfo::Entry {
                    bin_offset: u64::from(slot.offset),
                    path: path.to_string(),
                    line: u64::from(inst.dbg.line),
                    line_offset: u64::from(inst.dbg.line_offset),
                });
            }
        }
    }
    exec.resize(strings_base as usize, 0);
    exec.extend_from_slice(&result.string_region);

    // Export and import tables, keyed by linking signature alone.
    let mut export_info = Vec::new();
    let mut import_info = Vec::new();
    for f in prog.iter() {
        let data = prog.func(f);
        let Some(sig) = &data.linking_signature else {
            continue;
        };
        if data.to_export {
            append_table_entry(&mut export_info, sig, func_offsets[&f]);
        }
        if data.to_import != 0 {
            append_table_entry(&mut import_info, sig, data.to_import - 1);
        }
    }

    let dbg_info = if with_dbg {
        dbginfo::write(&dbg_entries, u64::from(instr_size), sizeof_gpr)
    } else {
        Vec::new()
    };

    log::debug!(
        "encoded {} instruction bytes, {} string bytes, {} global bytes",
        instr_size,
        strings_size,
        result.global_region_size
    );
    Ok(BackendResult {
        exec,
        executable_instr_size: u64::from(instr_size),
        constant_strings_size: u64::from(strings_size),
        global_region_size: result.global_region_size,
        export_info,
        import_info,
        dbg_info,
    })
}

fn encoded_size(inst: &lyrical_codegen::InstructionData) -> Result<u32, EncodeError> {
    for r in [inst.r1, inst.r2, inst.r3] {
        if r.id() > u8::MAX.into() {
            return Err(EncodeError::RegisterTooLarge(r.id()));
        }
    }
    let payload_len = match &inst.payload {
        Some(Payload::MachineCode(bytes)) => bytes.len(),
        _ => 0,
    };
    if payload_len > u16::MAX as usize {
        return Err(EncodeError::PayloadTooLarge(payload_len));
    }
    let mut size = 8;
    if inst.imm.is_some() {
        size += 8;
    }
    size += payload_len as u32;
    if let Some(hint) = inst.binsz {
        if hint % NOP_SIZE != 0 {
            return Err(EncodeError::BinszNotNopMultiple(hint));
        }
        if hint < size {
            return Err(EncodeError::BinszTooSmall { hint, need: size });
        }
        size = hint;
    }
    Ok(size)
}

fn emit_one(
    exec: &mut Vec<u8>,
    inst: &lyrical_codegen::InstructionData,
    imm: Option<i64>,
    size: u32,
) -> Result<(), EncodeError> {
    let start = exec.len();
    let payload: &[u8] = match &inst.payload {
        Some(Payload::MachineCode(bytes)) => bytes,
        _ => &[],
    };
    let mut flags = 0u8;
    if imm.is_some() {
        flags |= FLAG_IMM;
    }
    if !payload.is_empty() {
        flags |= FLAG_PAYLOAD;
    }
    exec.extend_from_slice(&(inst.opcode as u16).to_le_bytes());
    exec.push(inst.r1.id() as u8);
    exec.push(inst.r2.id() as u8);
    exec.push(inst.r3.id() as u8);
    exec.push(flags);
    exec.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    if let Some(v) = imm {
        exec.extend_from_slice(&v.to_le_bytes());
    }
    exec.extend_from_slice(payload);
    // Pad to the binsz hint with whole NOP encodings.
    while (exec.len() - start) < size as usize {
        exec.extend_from_slice(&(Opcode::Nop as u16).to_le_bytes());
        exec.extend_from_slice(&[0u8; 6]);
    }
    Ok(())
}

/// PC-relative opcodes whose symbolic targets resolve relative to the
/// instruction's own offset.
fn is_pc_relative(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Jeq
            | Opcode::Jne
            | Opcode::Jlt
            | Opcode::Jlte
            | Opcode::Jltu
            | Opcode::Jlteu
            | Opcode::Jz
            | Opcode::Jnz
            | Opcode::J
            | Opcode::Jl
            | Opcode::Jpush
            | Opcode::Afip
    )
}

fn resolve_imm(
    imm: &Imm,
    opcode: Opcode,
    slot: &InstSlot,
    func_offsets: &FxHashMap<Func, u32>,
    inst_offsets: &FxHashMap<(Func, Inst), u32>,
    global_base: u32,
    strings_base: u32,
) -> i64 {
    let pc_relative = is_pc_relative(opcode);
    imm.resolve(|term| {
        let target = match term {
            ImmTerm::InstOffset(i) => i64::from(inst_offsets[&(slot.func, i)]),
            ImmTerm::FuncOffset(f) => i64::from(func_offsets[&f]),
            ImmTerm::GlobalRegion => i64::from(global_base),
            ImmTerm::StringRegion => i64::from(strings_base),
            ImmTerm::Value(_) => unreachable!("literals are not resolved"),
        };
        if pc_relative {
            target - i64::from(slot.offset)
        } else {
            target
        }
    })
}

/// A decoded instruction, used by the interpreter and tests.
pub struct Decoded<'a> {
    pub opcode: Opcode,
    pub r1: u8,
    pub r2: u8,
    pub r3: u8,
    pub imm: Option<i64>,
    pub payload: &'a [u8],
    /// Total encoded size in bytes.
    pub size: u32,
}

/// Decode one instruction at `offset`. Returns `None` on a truncated or
/// out-of-range encoding.
pub fn decode(exec: &[u8], offset: usize) -> Option<Decoded<'_>> {
    let header = exec.get(offset..offset + 8)?;
    let raw_op = u16::from_le_bytes([header[0], header[1]]);
    let opcode = opcode_from_u16(raw_op)?;
    let flags = header[5];
    let payload_len = usize::from(u16::from_le_bytes([header[6], header[7]]));
    let mut cursor = offset + 8;
    let imm = if flags & FLAG_IMM != 0 {
        let bytes = exec.get(cursor..cursor + 8)?;
        cursor += 8;
        Some(i64::from_le_bytes(bytes.try_into().unwrap()))
    } else {
        None
    };
    let payload = exec.get(cursor..cursor + payload_len)?;
    cursor += payload_len;
    Some(Decoded {
        opcode,
        r1: header[2],
        r2: header[3],
        r3: header[4],
        imm,
        payload,
        size: (cursor - offset) as u32,
    })
}

fn opcode_from_u16(raw: u16) -> Option<Opcode> {
    if raw > Opcode::Comment as u16 {
        return None;
    }
    // The enum is a dense fieldless repr(u16); the bound check above makes
    // the transmute sound.
    Some(unsafe { core::mem::transmute::<u16, Opcode>(raw) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lyrical_codegen::ir::{InstructionData, Program, Reg};

    fn tiny_result() -> CompileResult {
        let mut prog = Program::new();
        let root = prog.root();
        let f = prog.func_mut(root);
        let mut li = InstructionData::new(Opcode::Li);
        li.r1 = Reg::new(1);
        li.imm = Some(Imm::value(42));
        f.append(li);
        let jpop = InstructionData::new(Opcode::Jpop);
        f.append(jpop);
        CompileResult {
            program: prog,
            string_region: b"hi\0".to_vec(),
            global_region_size: 16,
            src_file_paths: Vec::new(),
        }
    }

    #[test]
    fn layout_partitions_the_image() {
        let r = tiny_result();
        let out = encode(&r, RegionAlignment::Compact, 8, false).unwrap();
        assert_eq!(out.executable_instr_size, 16 + 8);
        assert_eq!(out.constant_strings_size, 3);
        assert_eq!(out.global_region_size, 16);
        // Strings start at the next 4-byte boundary after the code.
        assert_eq!(&out.exec[out.exec.len() - 3..], b"hi\0");
    }

    #[test]
    fn decode_round_trips() {
        let r = tiny_result();
        let out = encode(&r, RegionAlignment::Compact, 8, false).unwrap();
        let d = decode(&out.exec, 0).unwrap();
        assert_eq!(d.opcode, Opcode::Li);
        assert_eq!(d.r1, 1);
        assert_eq!(d.imm, Some(42));
        let d2 = decode(&out.exec, d.size as usize).unwrap();
        assert_eq!(d2.opcode, Opcode::Jpop);
        assert_eq!(d2.imm, None);
    }

    #[test]
    fn pc_relative_branches_resolve_backwards() {
        let mut prog = Program::new();
        let root = prog.root();
        let first = {
            let f = prog.func_mut(root);
            let mut li = InstructionData::new(Opcode::Li);
            li.r1 = Reg::new(1);
            li.imm = Some(Imm::value(0));
            f.append(li)
        };
        {
            let f = prog.func_mut(root);
            let mut j = InstructionData::new(Opcode::J);
            j.imm = Some(Imm::inst(first));
            f.append(j);
        }
        let r = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let out = encode(&r, RegionAlignment::Compact, 8, false).unwrap();
        // The li encodes in 16 bytes; the jump back is -16 relative.
        let d = decode(&out.exec, 16).unwrap();
        assert_eq!(d.opcode, Opcode::J);
        assert_eq!(d.imm, Some(-16));
    }

    #[test]
    fn binsz_pads_with_nops() {
        let mut prog = Program::new();
        let root = prog.root();
        {
            let f = prog.func_mut(root);
            let mut li = InstructionData::new(Opcode::Li);
            li.r1 = Reg::new(1);
            li.imm = Some(Imm::value(1));
            li.binsz = Some(32);
            f.append(li);
        }
        let r = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let out = encode(&r, RegionAlignment::Compact, 8, false).unwrap();
        assert_eq!(out.executable_instr_size, 32);
        let pad = decode(&out.exec, 16).unwrap();
        assert_eq!(pad.opcode, Opcode::Nop);
    }

    #[test]
    fn machinecode_payload_is_preserved_exactly() {
        let mut prog = Program::new();
        let root = prog.root();
        let raw = vec![0x90, 0x00, 0xCC, 0xFF];
        {
            let f = prog.func_mut(root);
            let mut mc = InstructionData::new(Opcode::Machinecode);
            mc.payload = Some(Payload::MachineCode(raw.clone()));
            f.append(mc);
        }
        let r = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let out = encode(&r, RegionAlignment::Compact, 8, false).unwrap();
        let d = decode(&out.exec, 0).unwrap();
        assert_eq!(d.opcode, Opcode::Machinecode);
        assert_eq!(d.payload, raw.as_slice());
    }

    #[test]
    fn comments_are_not_encoded() {
        let mut prog = Program::new();
        let root = prog.root();
        {
            let f = prog.func_mut(root);
            let mut c = InstructionData::new(Opcode::Comment);
            c.payload = Some(Payload::Comment("hello".into()));
            f.append(c);
            f.append(InstructionData::new(Opcode::Jpop));
        }
        let r = CompileResult {
            program: prog,
            string_region: Vec::new(),
            global_region_size: 0,
            src_file_paths: Vec::new(),
        };
        let out = encode(&r, RegionAlignment::Compact, 8, false).unwrap();
        assert_eq!(out.executable_instr_size, 8);
        assert_eq!(decode(&out.exec, 0).unwrap().opcode, Opcode::Jpop);
    }
}
