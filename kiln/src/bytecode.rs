use crate::{Kind, VmError, VmResult};

/// JVM bytecode opcodes. Operands are big-endian; branch offsets are
/// relative to the opcode of the branching instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    AconstNull = 0x01,
    IconstM1 = 0x02,
    Iconst0 = 0x03,
    Iconst1 = 0x04,
    Iconst2 = 0x05,
    Iconst3 = 0x06,
    Iconst4 = 0x07,
    Iconst5 = 0x08,
    Lconst0 = 0x09,
    Lconst1 = 0x0a,
    Fconst0 = 0x0b,
    Fconst1 = 0x0c,
    Fconst2 = 0x0d,
    Dconst0 = 0x0e,
    Dconst1 = 0x0f,
    Bipush = 0x10,
    Sipush = 0x11,
    Ldc = 0x12,
    LdcW = 0x13,
    Ldc2W = 0x14,
    Iload = 0x15,
    Lload = 0x16,
    Fload = 0x17,
    Dload = 0x18,
    Aload = 0x19,
    Iload0 = 0x1a,
    Iload1 = 0x1b,
    Iload2 = 0x1c,
    Iload3 = 0x1d,
    Lload0 = 0x1e,
    Lload1 = 0x1f,
    Lload2 = 0x20,
    Lload3 = 0x21,
    Fload0 = 0x22,
    Fload1 = 0x23,
    Fload2 = 0x24,
    Fload3 = 0x25,
    Dload0 = 0x26,
    Dload1 = 0x27,
    Dload2 = 0x28,
    Dload3 = 0x29,
    Aload0 = 0x2a,
    Aload1 = 0x2b,
    Aload2 = 0x2c,
    Aload3 = 0x2d,
    Iaload = 0x2e,
    Laload = 0x2f,
    Faload = 0x30,
    Daload = 0x31,
    Aaload = 0x32,
    Baload = 0x33,
    Caload = 0x34,
    Saload = 0x35,
    Istore = 0x36,
    Lstore = 0x37,
    Fstore = 0x38,
    Dstore = 0x39,
    Astore = 0x3a,
    Istore0 = 0x3b,
    Istore1 = 0x3c,
    Istore2 = 0x3d,
    Istore3 = 0x3e,
    Lstore0 = 0x3f,
    Lstore1 = 0x40,
    Lstore2 = 0x41,
    Lstore3 = 0x42,
    Fstore0 = 0x43,
    Fstore1 = 0x44,
    Fstore2 = 0x45,
    Fstore3 = 0x46,
    Dstore0 = 0x47,
    Dstore1 = 0x48,
    Dstore2 = 0x49,
    Dstore3 = 0x4a,
    Astore0 = 0x4b,
    Astore1 = 0x4c,
    Astore2 = 0x4d,
    Astore3 = 0x4e,
    Iastore = 0x4f,
    Lastore = 0x50,
    Fastore = 0x51,
    Dastore = 0x52,
    Aastore = 0x53,
    Bastore = 0x54,
    Castore = 0x55,
    Sastore = 0x56,
    Pop = 0x57,
    Pop2 = 0x58,
    Dup = 0x59,
    DupX1 = 0x5a,
    DupX2 = 0x5b,
    Dup2 = 0x5c,
    Dup2X1 = 0x5d,
    Dup2X2 = 0x5e,
    Swap = 0x5f,
    Iadd = 0x60,
    Ladd = 0x61,
    Fadd = 0x62,
    Dadd = 0x63,
    Isub = 0x64,
    Lsub = 0x65,
    Fsub = 0x66,
    Dsub = 0x67,
    Imul = 0x68,
    Lmul = 0x69,
    Fmul = 0x6a,
    Dmul = 0x6b,
    Idiv = 0x6c,
    Ldiv = 0x6d,
    Fdiv = 0x6e,
    Ddiv = 0x6f,
    Irem = 0x70,
    Lrem = 0x71,
    Frem = 0x72,
    Drem = 0x73,
    Ineg = 0x74,
    Lneg = 0x75,
    Fneg = 0x76,
    Dneg = 0x77,
    Ishl = 0x78,
    Lshl = 0x79,
    Ishr = 0x7a,
    Lshr = 0x7b,
    Iushr = 0x7c,
    Lushr = 0x7d,
    Iand = 0x7e,
    Land = 0x7f,
    Ior = 0x80,
    Lor = 0x81,
    Ixor = 0x82,
    Lxor = 0x83,
    Iinc = 0x84,
    I2l = 0x85,
    I2f = 0x86,
    I2d = 0x87,
    L2i = 0x88,
    L2f = 0x89,
    L2d = 0x8a,
    F2i = 0x8b,
    F2l = 0x8c,
    F2d = 0x8d,
    D2i = 0x8e,
    D2l = 0x8f,
    D2f = 0x90,
    I2b = 0x91,
    I2c = 0x92,
    I2s = 0x93,
    Lcmp = 0x94,
    Fcmpl = 0x95,
    Fcmpg = 0x96,
    Dcmpl = 0x97,
    Dcmpg = 0x98,
    Ifeq = 0x99,
    Ifne = 0x9a,
    Iflt = 0x9b,
    Ifge = 0x9c,
    Ifgt = 0x9d,
    Ifle = 0x9e,
    IfIcmpeq = 0x9f,
    IfIcmpne = 0xa0,
    IfIcmplt = 0xa1,
    IfIcmpge = 0xa2,
    IfIcmpgt = 0xa3,
    IfIcmple = 0xa4,
    IfAcmpeq = 0xa5,
    IfAcmpne = 0xa6,
    Goto = 0xa7,
    Jsr = 0xa8,
    Ret = 0xa9,
    Tableswitch = 0xaa,
    Lookupswitch = 0xab,
    Ireturn = 0xac,
    Lreturn = 0xad,
    Freturn = 0xae,
    Dreturn = 0xaf,
    Areturn = 0xb0,
    Return = 0xb1,
    Getstatic = 0xb2,
    Putstatic = 0xb3,
    Getfield = 0xb4,
    Putfield = 0xb5,
    Invokevirtual = 0xb6,
    Invokespecial = 0xb7,
    Invokestatic = 0xb8,
    Invokeinterface = 0xb9,
    Invokedynamic = 0xba,
    New = 0xbb,
    Newarray = 0xbc,
    Anewarray = 0xbd,
    Arraylength = 0xbe,
    Athrow = 0xbf,
    Checkcast = 0xc0,
    Instanceof = 0xc1,
    Monitorenter = 0xc2,
    Monitorexit = 0xc3,
    Wide = 0xc4,
    Multianewarray = 0xc5,
    Ifnull = 0xc6,
    Ifnonnull = 0xc7,
    GotoW = 0xc8,
    JsrW = 0xc9,
}

impl Opcode {
    pub const COUNT: usize = Opcode::JsrW as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Opcode::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        // SAFETY: the caller guarantees `byte < COUNT`.
        unsafe { core::mem::transmute::<u8, Opcode>(byte) }
    }

    /// Operand bytes following the opcode, `None` for the variable-length
    /// `TABLESWITCH`, `LOOKUPSWITCH` and `WIDE`.
    pub const fn operand_bytes(self) -> Option<usize> {
        match self {
            Opcode::Tableswitch | Opcode::Lookupswitch | Opcode::Wide => None,
            Opcode::Bipush
            | Opcode::Ldc
            | Opcode::Iload
            | Opcode::Lload
            | Opcode::Fload
            | Opcode::Dload
            | Opcode::Aload
            | Opcode::Istore
            | Opcode::Lstore
            | Opcode::Fstore
            | Opcode::Dstore
            | Opcode::Astore
            | Opcode::Ret
            | Opcode::Newarray => Some(1),
            Opcode::Sipush
            | Opcode::LdcW
            | Opcode::Ldc2W
            | Opcode::Iinc
            | Opcode::Ifeq
            | Opcode::Ifne
            | Opcode::Iflt
            | Opcode::Ifge
            | Opcode::Ifgt
            | Opcode::Ifle
            | Opcode::IfIcmpeq
            | Opcode::IfIcmpne
            | Opcode::IfIcmplt
            | Opcode::IfIcmpge
            | Opcode::IfIcmpgt
            | Opcode::IfIcmple
            | Opcode::IfAcmpeq
            | Opcode::IfAcmpne
            | Opcode::Goto
            | Opcode::Jsr
            | Opcode::Getstatic
            | Opcode::Putstatic
            | Opcode::Getfield
            | Opcode::Putfield
            | Opcode::Invokevirtual
            | Opcode::Invokespecial
            | Opcode::Invokestatic
            | Opcode::New
            | Opcode::Anewarray
            | Opcode::Checkcast
            | Opcode::Instanceof
            | Opcode::Ifnull
            | Opcode::Ifnonnull => Some(2),
            Opcode::Multianewarray => Some(3),
            Opcode::Invokeinterface
            | Opcode::Invokedynamic
            | Opcode::GotoW
            | Opcode::JsrW => Some(4),
            _ => Some(0),
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Opcode is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Opcode>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Address of a branch: `pc` has already moved past the opcode byte.
#[inline(always)]
pub fn branch_target(pc: usize, offset: i32) -> isize {
    pc as isize - 1 + offset as isize
}

/// Padding after a switch opcode at `opcode_pc` so its operands start on a
/// 4-byte boundary.
pub const fn switch_padding(opcode_pc: usize) -> usize {
    (4 - (opcode_pc + 1) % 4) % 4
}

/// A forward branch whose 16-bit offset has not been resolved yet.
#[derive(Debug)]
#[must_use]
pub struct Label {
    opcode_pos: usize,
    offset_pos: usize,
}

/// Unresolved targets of a `TABLESWITCH` or `LOOKUPSWITCH`. Slot 0 is the
/// default target, then one slot per case in emission order.
#[derive(Debug)]
pub struct SwitchTargets {
    opcode_pos: usize,
    slots: Vec<usize>,
}

impl SwitchTargets {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Assembles JVM bytecode. Picks the short forms (`ILOAD_0`, `ICONST_2`) and
/// the `WIDE` prefix as needed.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    buf: Vec<u8>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Emit an instruction without operands.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.buf.push(op as u8);
        self
    }

    pub fn op_u8(&mut self, op: Opcode, operand: u8) -> &mut Self {
        self.op(op);
        self.emit_u8(operand);
        self
    }

    pub fn op_u16(&mut self, op: Opcode, operand: u16) -> &mut Self {
        self.op(op);
        self.emit_u16(operand);
        self
    }

    // ── constants and locals ───────────────────────────────────────

    pub fn iconst(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op(
                // SAFETY: ICONST_M1..ICONST_5 are contiguous.
                unsafe { Opcode::from_u8_unchecked((Opcode::Iconst0 as i32 + value) as u8) },
            ),
            -128..=127 => self.op_u8(Opcode::Bipush, value as i8 as u8),
            _ => self.op_u16(Opcode::Sipush, value as i16 as u16),
        }
    }

    pub fn ldc(&mut self, index: u16) -> &mut Self {
        if index <= u8::MAX as u16 {
            self.op_u8(Opcode::Ldc, index as u8)
        } else {
            self.op_u16(Opcode::LdcW, index)
        }
    }

    fn local_op(&mut self, kind: Kind, index: u16, ops: [Opcode; 5], short: [Opcode; 5]) -> &mut Self {
        let which = match kind.stack_kind() {
            Kind::Int => 0,
            Kind::Long => 1,
            Kind::Float => 2,
            Kind::Double => 3,
            _ => 4,
        };
        if index < 4 {
            // SAFETY: the four short forms of each kind are contiguous.
            let op = unsafe { Opcode::from_u8_unchecked(short[which] as u8 + index as u8) };
            self.op(op)
        } else if index <= u8::MAX as u16 {
            self.op_u8(ops[which], index as u8)
        } else {
            self.op(Opcode::Wide);
            self.op_u16(ops[which], index)
        }
    }

    pub fn load(&mut self, kind: Kind, index: u16) -> &mut Self {
        use Opcode::*;
        self.local_op(
            kind,
            index,
            [Iload, Lload, Fload, Dload, Aload],
            [Iload0, Lload0, Fload0, Dload0, Aload0],
        )
    }

    pub fn store(&mut self, kind: Kind, index: u16) -> &mut Self {
        use Opcode::*;
        self.local_op(
            kind,
            index,
            [Istore, Lstore, Fstore, Dstore, Astore],
            [Istore0, Lstore0, Fstore0, Dstore0, Astore0],
        )
    }

    pub fn iinc(&mut self, index: u16, delta: i16) -> &mut Self {
        if index <= u8::MAX as u16 && (i8::MIN as i16..=i8::MAX as i16).contains(&delta) {
            self.op_u8(Opcode::Iinc, index as u8);
            self.emit_u8(delta as i8 as u8);
        } else {
            self.op(Opcode::Wide);
            self.op_u16(Opcode::Iinc, index);
            self.emit_u16(delta as u16);
        }
        self
    }

    // ── objects and calls ──────────────────────────────────────────

    pub fn invoke(&mut self, op: Opcode, index: u16) -> &mut Self {
        self.op_u16(op, index);
        if op == Opcode::Invokeinterface {
            // historical count and zero bytes
            self.emit_u8(0);
            self.emit_u8(0);
        }
        self
    }

    pub fn multianewarray(&mut self, index: u16, dimensions: u8) -> &mut Self {
        self.op_u16(Opcode::Multianewarray, index);
        self.emit_u8(dimensions);
        self
    }

    // ── branches ───────────────────────────────────────────────────

    /// Emit a forward branch; resolve it with [`bind`](Self::bind).
    pub fn jump(&mut self, op: Opcode) -> Label {
        let opcode_pos = self.buf.len();
        self.op(op);
        let offset_pos = self.buf.len();
        self.emit_u16(0);
        Label {
            opcode_pos,
            offset_pos,
        }
    }

    /// Bind a forward branch to the current position.
    pub fn bind(&mut self, label: Label) -> VmResult<()> {
        let offset = self.buf.len() as isize - label.opcode_pos as isize;
        let offset = i16::try_from(offset).map_err(|_| VmError::JumpOutOfRange(offset))?;
        self.buf[label.offset_pos..label.offset_pos + 2].copy_from_slice(&offset.to_be_bytes());
        Ok(())
    }

    /// Emit a branch back to `target`, an offset obtained from
    /// [`current_offset`](Self::current_offset).
    pub fn jump_back(&mut self, op: Opcode, target: usize) -> VmResult<()> {
        let offset = target as isize - self.buf.len() as isize;
        let offset = i16::try_from(offset).map_err(|_| VmError::JumpOutOfRange(offset))?;
        self.op_u16(op, offset as u16);
        Ok(())
    }

    fn switch_header(&mut self, op: Opcode) -> usize {
        let opcode_pos = self.buf.len();
        self.op(op);
        for _ in 0..switch_padding(opcode_pos) {
            self.emit_u8(0);
        }
        opcode_pos
    }

    /// `TABLESWITCH` over `low..=high`.
    pub fn table_switch(&mut self, low: i32, high: i32) -> SwitchTargets {
        let opcode_pos = self.switch_header(Opcode::Tableswitch);
        let mut slots = vec![self.buf.len()];
        self.emit_i32(0);
        self.emit_i32(low);
        self.emit_i32(high);
        for _ in low..=high {
            slots.push(self.buf.len());
            self.emit_i32(0);
        }
        SwitchTargets { opcode_pos, slots }
    }

    /// `LOOKUPSWITCH` over `keys`, which must be sorted.
    pub fn lookup_switch(&mut self, keys: &[i32]) -> SwitchTargets {
        let opcode_pos = self.switch_header(Opcode::Lookupswitch);
        let mut slots = vec![self.buf.len()];
        self.emit_i32(0);
        self.emit_i32(keys.len() as i32);
        for key in keys {
            self.emit_i32(*key);
            slots.push(self.buf.len());
            self.emit_i32(0);
        }
        SwitchTargets { opcode_pos, slots }
    }

    /// Point switch target `slot` at the current position.
    pub fn bind_switch(&mut self, targets: &SwitchTargets, slot: usize) {
        let offset = (self.buf.len() - targets.opcode_pos) as i32;
        let pos = targets.slots[slot];
        self.buf[pos..pos + 4].copy_from_slice(&offset.to_be_bytes());
    }
}

/// Decode `code` into `(pc, opcode)` pairs.
pub fn disassemble(code: &[u8]) -> VmResult<Vec<(usize, Opcode)>> {
    let mut out = Vec::new();
    let mut pc = 0;
    let read_i32 = |at: usize| -> VmResult<i32> {
        code.get(at..at + 4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(VmError::CodeBounds {
                method: "<disassembly>".into(),
                pc: at,
            })
    };
    while pc < code.len() {
        let op = Opcode::try_from(code[pc]).map_err(|opcode| VmError::UnknownOpcode { opcode, pc })?;
        out.push((pc, op));
        let operands = match op.operand_bytes() {
            Some(n) => n,
            None => match op {
                Opcode::Wide => match code.get(pc + 1).copied().map(Opcode::try_from) {
                    Some(Ok(Opcode::Iinc)) => 5,
                    _ => 3,
                },
                Opcode::Tableswitch => {
                    let base = pc + 1 + switch_padding(pc);
                    let (low, high) = (read_i32(base + 4)?, read_i32(base + 8)?);
                    switch_padding(pc) + 12 + 4 * (high - low + 1).max(0) as usize
                }
                _ => {
                    let base = pc + 1 + switch_padding(pc);
                    let pairs = read_i32(base + 4)?.max(0) as usize;
                    switch_padding(pc) + 8 + 8 * pairs
                }
            },
        };
        pc += 1 + operands;
    }
    Ok(out)
}
