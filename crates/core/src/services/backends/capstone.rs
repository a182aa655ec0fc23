use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use capstone::arch::{arm, arm64, x86, ArchOperand};
use capstone::{arch, prelude::*, Capstone, InsnGroupId, InsnGroupType, RegId};

use crate::services::analysis::{
    AnalysisBackend, AnalysisError, AnalysisRequest, BasicBlock, BlockEdge, BlockEdgeKind,
    CfgOptions, ControlFlowGraph, FunctionRecord, LoadedBinary, StringReference,
};
use crate::services::image::BinaryImage;

/// Instruction budget per function when the request sets none.
pub const DEFAULT_MAX_INSTRUCTIONS: usize = 16_384;

/// Shortest printable run reported as a string reference.
pub const MIN_STRING_LEN: usize = 2;

const MAX_INSN_BYTES: usize = 16;

const UNCONDITIONAL_JUMPS: &[&str] = &["jmp", "ljmp", "b", "br", "bx", "braa", "brab"];

pub struct CapstoneBackend;

fn capstone_version() -> Option<String> {
    let (major, minor) = Capstone::lib_version();
    Some(format!("capstone {major}.{minor}"))
}

fn make_cs(arch: &str) -> Result<Capstone, AnalysisError> {
    let built = match arch {
        "x86_64" | "amd64" => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).detail(true).build()
        }
        "x86" | "i386" => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode32).detail(true).build()
        }
        "arm" | "armv7" => {
            Capstone::new().arm().mode(arch::arm::ArchMode::Arm).detail(true).build()
        }
        "arm64" | "aarch64" => {
            Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).detail(true).build()
        }
        other => {
            return Err(AnalysisError::Backend(format!(
                "unsupported architecture for capstone: {other}"
            )))
        }
    };
    built.map_err(|e| AnalysisError::Backend(format!("capstone init failed for {arch}: {e}")))
}

/// Operand reduced to what constant tracking needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Reg(u16),
    Imm(u64),
    /// Memory operand; `pc_target` is set when the address is PC-relative,
    /// `width` when the decoder reports the access size in bytes.
    Mem { pc_target: Option<u64>, width: Option<usize> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Call,
    Jump { conditional: bool },
    Return,
}

#[derive(Debug, Clone)]
struct Decoded {
    address: u64,
    len: u64,
    mnemonic: String,
    operands: Vec<Operand>,
    flow: Flow,
}

impl Decoded {
    fn next(&self) -> u64 {
        self.address.wrapping_add(self.len)
    }

    /// Direct branch target (first immediate operand).
    fn direct_target(&self) -> Option<u64> {
        self.operands.iter().find_map(|op| match op {
            Operand::Imm(v) => Some(*v),
            _ => None,
        })
    }

    fn pc_relative_target(&self) -> Option<u64> {
        self.operands.iter().find_map(|op| match op {
            Operand::Mem { pc_target, .. } => *pc_target,
            _ => None,
        })
    }
}

/// Register constants known at a program point.
#[derive(Debug, Clone, Default)]
struct RegState {
    values: HashMap<u16, u64>,
}

impl RegState {
    fn get(&self, reg: u16) -> Option<u64> {
        self.values.get(&reg).copied()
    }

    fn set(&mut self, reg: u16, value: u64) {
        self.values.insert(reg, value);
    }

    fn forget(&mut self, reg: u16) {
        self.values.remove(&reg);
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}

/// Ordered, de-duplicated set of constants a function computes or uses.
#[derive(Debug, Default)]
struct ValueSet {
    order: Vec<u64>,
    seen: HashSet<u64>,
}

impl ValueSet {
    fn push(&mut self, value: u64) {
        if self.seen.insert(value) {
            self.order.push(value);
        }
    }
}

#[derive(Debug, Default)]
struct FunctionBody {
    instructions: Vec<u64>,
    runtime_values: Vec<u64>,
}

struct Recovery<'a> {
    cs: &'a Capstone,
    image: &'a BinaryImage,
    options: &'a CfgOptions,
}

impl<'a> Recovery<'a> {
    fn new(cs: &'a Capstone, image: &'a BinaryImage, options: &'a CfgOptions) -> Self {
        Self { cs, image, options }
    }

    fn is_pc(&self, reg: RegId) -> bool {
        matches!(self.cs.reg_name(reg).as_deref(), Some("rip" | "eip" | "pc"))
    }

    /// Bytes a load into `reg` reads: 4 for AArch64 `w` registers, the
    /// image word size otherwise.
    fn reg_width(&self, reg: u16) -> usize {
        match self.cs.reg_name(RegId(reg)) {
            Some(name) if name.starts_with('w') => 4,
            _ => self.image.word_size,
        }
    }

    fn decode_at(&self, address: u64) -> Option<Decoded> {
        let code = self.image.code_at(address)?;
        let window = &code[..code.len().min(MAX_INSN_BYTES)];
        let insns = self.cs.disasm_count(window, address, 1).ok()?;
        let insn = insns.iter().next()?;
        let detail = self.cs.insn_detail(insn).ok()?;
        let len = insn.bytes().len() as u64;
        if len == 0 {
            return None;
        }

        let groups = detail.groups();
        let in_group = |id: u8| groups.iter().any(|g| *g == InsnGroupId(id));
        let mnemonic = insn.mnemonic().unwrap_or("").to_lowercase();
        let flow = if in_group(InsnGroupType::CS_GRP_RET as u8) {
            Flow::Return
        } else if in_group(InsnGroupType::CS_GRP_CALL as u8) {
            Flow::Call
        } else if in_group(InsnGroupType::CS_GRP_JUMP as u8) {
            Flow::Jump { conditional: !UNCONDITIONAL_JUMPS.contains(&mnemonic.as_str()) }
        } else {
            Flow::Normal
        };

        let operands = detail
            .arch_detail()
            .operands()
            .into_iter()
            .filter_map(|op| self.normalize(op, address, len))
            .collect();

        Some(Decoded { address, len, mnemonic, operands, flow })
    }

    fn normalize(&self, op: ArchOperand, address: u64, len: u64) -> Option<Operand> {
        match op {
            ArchOperand::X86Operand(op) => match op.op_type {
                x86::X86OperandType::Reg(reg) => Some(Operand::Reg(reg.0)),
                x86::X86OperandType::Imm(imm) => Some(Operand::Imm(imm as u64)),
                x86::X86OperandType::Mem(mem) => {
                    let pc_target = self.is_pc(mem.base()).then(|| {
                        address.wrapping_add(len).wrapping_add(mem.disp() as u64)
                    });
                    let width = (op.size > 0).then_some(op.size as usize);
                    Some(Operand::Mem { pc_target, width })
                }
                _ => None,
            },
            ArchOperand::ArmOperand(op) => match op.op_type {
                arm::ArmOperandType::Reg(reg) => Some(Operand::Reg(reg.0)),
                arm::ArmOperandType::Imm(imm) => Some(Operand::Imm(imm as u32 as u64)),
                arm::ArmOperandType::Mem(mem) => {
                    // ARM reads PC as the current instruction + 8, word aligned.
                    let pc_target = self.is_pc(mem.base()).then(|| {
                        (address.wrapping_add(8) & !3).wrapping_add(mem.disp() as i64 as u64)
                    });
                    Some(Operand::Mem { pc_target, width: Some(4) })
                }
                _ => None,
            },
            ArchOperand::Arm64Operand(op) => match op.op_type {
                arm64::Arm64OperandType::Reg(reg) => Some(Operand::Reg(reg.0)),
                arm64::Arm64OperandType::Imm(imm) => Some(Operand::Imm(imm as u64)),
                arm64::Arm64OperandType::Mem(_) => {
                    Some(Operand::Mem { pc_target: None, width: None })
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Record the constants `insn` touches and update tracked registers.
    fn track(&self, insn: &Decoded, state: &mut RegState, values: &mut ValueSet) {
        for op in &insn.operands {
            match op {
                Operand::Imm(v) => values.push(*v),
                Operand::Mem { pc_target: Some(addr), .. } => values.push(*addr),
                _ => {}
            }
        }
        if !self.options.advanced_backward_slicing {
            return;
        }
        if insn.flow == Flow::Call {
            state.clear();
            return;
        }
        if insn.flow != Flow::Normal {
            return;
        }
        let Some(Operand::Reg(dst)) = insn.operands.first().copied() else { return };

        let load = |addr: u64, width: usize| self.image.read_uint(addr, width);
        let value = match (insn.mnemonic.as_str(), &insn.operands[1..]) {
            ("mov" | "movabs" | "movz" | "adr" | "adrp", [Operand::Imm(v)]) => Some(*v),
            ("mov", [Operand::Reg(src)]) => state.get(*src),
            ("lea", [Operand::Mem { pc_target: Some(addr), .. }]) => Some(*addr),
            ("mov" | "ldr", [Operand::Mem { pc_target: Some(addr), width }]) => {
                load(*addr, width.unwrap_or_else(|| self.reg_width(dst)))
            }
            ("ldr", [Operand::Imm(addr)]) => load(*addr, self.reg_width(dst)),
            ("add", [Operand::Imm(v)]) => state.get(dst).map(|b| b.wrapping_add(*v)),
            ("add", [Operand::Reg(src), Operand::Imm(v)]) => {
                state.get(*src).map(|b| b.wrapping_add(*v))
            }
            ("sub", [Operand::Imm(v)]) => state.get(dst).map(|b| b.wrapping_sub(*v)),
            ("sub", [Operand::Reg(src), Operand::Imm(v)]) => {
                state.get(*src).map(|b| b.wrapping_sub(*v))
            }
            _ => None,
        };
        match value {
            Some(v) => {
                state.set(dst, v);
                values.push(v);
            }
            None => state.forget(dst),
        }
    }

    /// Recursive descent over one function; returns its body and appends
    /// its blocks to `blocks`. Direct call targets land in `callees`.
    fn recover_function(
        &self,
        entry: u64,
        size: Option<u64>,
        blocks: &mut Vec<BasicBlock>,
        callees: &mut Vec<u64>,
    ) -> FunctionBody {
        let budget = self.options.max_instructions.unwrap_or(DEFAULT_MAX_INSTRUCTIONS);
        let bounds = match size.filter(|s| *s > 0) {
            Some(s) => Some((entry, entry.saturating_add(s))),
            None => self
                .image
                .executable_section_at(entry)
                .map(|sec| (sec.start, sec.start.saturating_add(sec.file_size as u64))),
        };
        let within = |addr: u64| bounds.is_some_and(|(lo, hi)| addr >= lo && addr < hi);

        let mut body = FunctionBody::default();
        let mut values = ValueSet::default();
        let mut decoded: HashSet<u64> = HashSet::new();
        let mut queue: VecDeque<(u64, RegState)> = VecDeque::new();
        queue.push_back((entry, RegState::default()));

        while let Some((start, mut state)) = queue.pop_front() {
            if decoded.contains(&start) || body.instructions.len() >= budget {
                continue;
            }
            if !self.options.keep_input_state {
                state.clear();
            }

            let mut addr = start;
            let mut count: u32 = 0;
            let mut successors: Vec<BlockEdge> = Vec::new();
            while body.instructions.len() < budget {
                let Some(insn) = self.decode_at(addr) else { break };
                decoded.insert(addr);
                body.instructions.push(addr);
                count += 1;
                self.track(&insn, &mut state, &mut values);
                let next = insn.next();

                match insn.flow {
                    Flow::Normal => {}
                    Flow::Return => break,
                    Flow::Call => {
                        if let Some(target) = insn.direct_target() {
                            successors.push(BlockEdge { target, kind: BlockEdgeKind::Call });
                            if self.image.executable_section_at(target).is_some() {
                                callees.push(target);
                            }
                        } else if let Some(target) =
                            insn.pc_relative_target().and_then(|slot| self.image.read_word(slot))
                        {
                            successors
                                .push(BlockEdge { target, kind: BlockEdgeKind::IndirectCall });
                        }
                        if within(next) {
                            successors
                                .push(BlockEdge { target: next, kind: BlockEdgeKind::Fallthrough });
                            queue.push_back((next, state.clone()));
                        }
                        break;
                    }
                    Flow::Jump { conditional } => {
                        if let Some(target) = insn.direct_target() {
                            let kind = if conditional {
                                BlockEdgeKind::ConditionalJump
                            } else {
                                BlockEdgeKind::Jump
                            };
                            successors.push(BlockEdge { target, kind });
                            if within(target) {
                                queue.push_back((target, state.clone()));
                            }
                        } else if let Some(target) =
                            insn.pc_relative_target().and_then(|slot| self.image.read_word(slot))
                        {
                            successors
                                .push(BlockEdge { target, kind: BlockEdgeKind::IndirectJump });
                        }
                        if conditional && within(next) {
                            successors
                                .push(BlockEdge { target: next, kind: BlockEdgeKind::Fallthrough });
                            queue.push_back((next, state.clone()));
                        }
                        break;
                    }
                }

                if !within(next) {
                    break;
                }
                if decoded.contains(&next) {
                    successors.push(BlockEdge { target: next, kind: BlockEdgeKind::Fallthrough });
                    break;
                }
                addr = next;
            }

            if count > 0 {
                blocks.push(BasicBlock { start, len: count, successors });
            }
        }

        body.runtime_values = values.order;
        body
    }
}

/// Binary after capstone CFG recovery.
struct CapstoneProgram {
    image: BinaryImage,
    cfg: ControlFlowGraph,
    bodies: HashMap<u64, FunctionBody>,
    code_addresses: HashSet<u64>,
}

impl LoadedBinary for CapstoneProgram {
    fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    fn string_references(
        &self,
        function: &FunctionRecord,
    ) -> Result<Vec<StringReference>, AnalysisError> {
        let body = self.bodies.get(&function.address).ok_or_else(|| {
            AnalysisError::Backend(format!(
                "function 0x{:x} is not part of the recovered CFG",
                function.address
            ))
        })?;
        if body.instructions.is_empty() {
            return Err(AnalysisError::DegenerateFunction {
                address: function.address,
                reason: "no decodable instructions".into(),
            });
        }

        let mut refs = Vec::new();
        for &value in &body.runtime_values {
            // Code pointers and pointers to code pointers are not strings.
            if self.code_addresses.contains(&value) {
                continue;
            }
            if self.image.read_word(value).is_some_and(|w| self.code_addresses.contains(&w)) {
                continue;
            }
            if let Some(bytes) = self.image.c_string_at(value) {
                if bytes.len() >= MIN_STRING_LEN {
                    refs.push(StringReference { address: value, bytes: bytes.to_vec() });
                }
            }
        }
        Ok(refs)
    }
}

impl CapstoneBackend {
    fn load_bytes(path: &Path) -> Result<Vec<u8>, AnalysisError> {
        fs::read(path).map_err(|_| AnalysisError::MissingBinary(path.to_path_buf()))
    }
}

impl AnalysisBackend for CapstoneBackend {
    fn load(&self, request: &AnalysisRequest) -> Result<Box<dyn LoadedBinary>, AnalysisError> {
        let bytes = Self::load_bytes(&request.binary_path)?;
        let image = BinaryImage::parse(bytes).map_err(|reason| AnalysisError::Load {
            path: request.binary_path.clone(),
            reason,
        })?;

        let arch = request
            .arch
            .as_deref()
            .map(str::to_lowercase)
            .or_else(|| image.arch.clone())
            .ok_or_else(|| AnalysisError::Load {
                path: request.binary_path.clone(),
                reason: "unknown architecture; pass an explicit arch hint".into(),
            })?;
        let cs = make_cs(&arch)?;
        log::debug!(
            "capstone: {} sections, {} function symbols, arch {arch}",
            image.sections.len(),
            image.symbols.len()
        );

        let mut functions: Vec<FunctionRecord> = image
            .symbols
            .iter()
            .map(|sym| FunctionRecord {
                address: sym.address,
                name: Some(sym.name.clone()),
                size: sym.size,
            })
            .collect();
        let mut known: HashSet<u64> = functions.iter().map(|f| f.address).collect();
        if let Some(entry) = image.entry {
            if image.executable_section_at(entry).is_some() && known.insert(entry) {
                functions.push(FunctionRecord {
                    address: entry,
                    name: Some("entry".into()),
                    size: None,
                });
            }
        }

        let recovery = Recovery::new(&cs, &image, &request.options);
        let mut basic_blocks = Vec::new();
        let mut bodies = HashMap::new();
        let mut idx = 0;
        while idx < functions.len() {
            let (address, size) = (functions[idx].address, functions[idx].size);
            let mut callees = Vec::new();
            let body = recovery.recover_function(address, size, &mut basic_blocks, &mut callees);
            for target in callees {
                if known.insert(target) {
                    functions.push(FunctionRecord {
                        address: target,
                        name: Some(format!("sub_{target:x}")),
                        size: None,
                    });
                }
            }
            bodies.insert(address, body);
            idx += 1;
        }

        let mut code_addresses: HashSet<u64> =
            bodies.values().flat_map(|b| b.instructions.iter().copied()).collect();
        code_addresses.extend(basic_blocks.iter().map(|b| b.start));

        let cfg = ControlFlowGraph {
            functions,
            basic_blocks,
            backend_version: capstone_version(),
            backend_path: None,
        };
        Ok(Box::new(CapstoneProgram { image, cfg, bodies, code_addresses }))
    }

    fn name(&self) -> &'static str {
        "capstone"
    }
}
