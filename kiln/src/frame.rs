use std::fmt::Write;

use crate::{Arena, FieldInfo, MethodRef, Reference};

/// Header slots between the parameter region and `fp`.
pub const FRAME_HEADER_SLOTS: usize = 3;
/// `fp - 1`: metadata of the method running in the frame.
pub const METHOD_INFO_OFFSET: isize = -1;
/// `fp - 2`: caller frame pointer.
pub const CALLER_FP_OFFSET: isize = -2;
/// `fp - 3`: caller return program counter.
pub const RETURN_PC_OFFSET: isize = -3;
/// Return pc of a frame entered from the host rather than from bytecode.
pub const MARKER_PC: i32 = -1;

#[inline(always)]
pub fn offset(base: usize, offset: isize) -> usize {
    base.wrapping_add_signed(offset)
}

/// Offset of parameter 0 relative to `fp` for a method consuming
/// `argument_slots` slots.
pub const fn argument_frame_pointer_offset(argument_slots: usize) -> isize {
    -((FRAME_HEADER_SLOTS + argument_slots) as isize)
}

/// Frame-relative offset of local `index`. Indices below the argument count
/// alias the parameter region, the rest live above `fp`.
pub const fn local_frame_pointer_offset(index: usize, argument_slots: usize) -> isize {
    if index < argument_slots {
        argument_frame_pointer_offset(argument_slots) + index as isize
    } else {
        (index - argument_slots) as isize
    }
}

/// Cursor over one frame of a thread stack.
///
/// Holds no state beyond `(fp, sp, pc)`; every structural offset is derived
/// from the method metadata stored in the frame header.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameView {
    pub fp: usize,
    pub sp: usize,
    pub pc: usize,
}

impl FrameView {
    pub fn new(fp: usize, sp: usize, pc: usize) -> Self {
        Self { fp, sp, pc }
    }

    pub fn set(&mut self, fp: usize, sp: usize, pc: usize) {
        self.fp = fp;
        self.sp = sp;
        self.pc = pc;
    }

    pub fn method_info(&self, arena: &Arena) -> Option<MethodRef> {
        arena
            .o4(offset(self.fp, METHOD_INFO_OFFSET))
            .and_then(Reference::as_method)
            .cloned()
    }

    pub fn set_method_info(&self, arena: &mut Arena, method: &MethodRef) {
        arena.set_o4(
            offset(self.fp, METHOD_INFO_OFFSET),
            Some(Reference::Method(method.clone())),
        );
    }

    pub fn caller_fp(&self, arena: &Arena) -> usize {
        arena.i4(offset(self.fp, CALLER_FP_OFFSET)) as usize
    }

    pub fn return_pc(&self, arena: &Arena) -> i32 {
        arena.i4(offset(self.fp, RETURN_PC_OFFSET))
    }

    fn consume_argument_slots(&self, arena: &Arena) -> usize {
        self.method_info(arena)
            .map_or(0, |m| m.consume_argument_slots())
    }

    pub fn argument_frame_pointer_offset(&self, arena: &Arena) -> isize {
        argument_frame_pointer_offset(self.consume_argument_slots(arena))
    }

    /// Offset of the first operand stack slot relative to `fp`.
    pub fn stack_offset(&self, arena: &Arena) -> isize {
        match self.method_info(arena) {
            Some(m) => (m.max_locals - m.consume_argument_slots()) as isize,
            None => 0,
        }
    }

    pub fn local_frame_pointer_offset(&self, arena: &Arena, index: usize) -> isize {
        local_frame_pointer_offset(index, self.consume_argument_slots(arena))
    }

    fn parameter_addr(&self, arena: &Arena, index: usize) -> usize {
        offset(
            self.fp,
            self.argument_frame_pointer_offset(arena) + index as isize,
        )
    }

    fn local_addr(&self, arena: &Arena, index: usize) -> usize {
        offset(self.fp, self.local_frame_pointer_offset(arena, index))
    }

    fn stack_addr(&self, arena: &Arena, index: usize) -> usize {
        offset(self.fp, self.stack_offset(arena) + index as isize)
    }

    pub fn parameter_i4(&self, arena: &Arena, index: usize) -> i32 {
        arena.i4(self.parameter_addr(arena, index))
    }

    pub fn set_parameter_i4(&self, arena: &mut Arena, index: usize, value: i32) {
        let addr = self.parameter_addr(arena, index);
        arena.set_i4(addr, value);
    }

    pub fn parameter_o4(&self, arena: &Arena, index: usize) -> Option<Reference> {
        arena.o4(self.parameter_addr(arena, index)).cloned()
    }

    pub fn set_parameter_o4(&self, arena: &mut Arena, index: usize, value: Option<Reference>) {
        let addr = self.parameter_addr(arena, index);
        arena.set_o4(addr, value);
    }

    pub fn local_i4(&self, arena: &Arena, index: usize) -> i32 {
        arena.i4(self.local_addr(arena, index))
    }

    pub fn set_local_i4(&self, arena: &mut Arena, index: usize, value: i32) {
        let addr = self.local_addr(arena, index);
        arena.set_i4(addr, value);
    }

    pub fn local_o4(&self, arena: &Arena, index: usize) -> Option<Reference> {
        arena.o4(self.local_addr(arena, index)).cloned()
    }

    pub fn set_local_o4(&self, arena: &mut Arena, index: usize, value: Option<Reference>) {
        let addr = self.local_addr(arena, index);
        arena.set_o4(addr, value);
    }

    pub fn stack_i4(&self, arena: &Arena, index: usize) -> i32 {
        arena.i4(self.stack_addr(arena, index))
    }

    pub fn set_stack_i4(&self, arena: &mut Arena, index: usize, value: i32) {
        let addr = self.stack_addr(arena, index);
        arena.set_i4(addr, value);
    }

    pub fn stack_o4(&self, arena: &Arena, index: usize) -> Option<Reference> {
        arena.o4(self.stack_addr(arena, index)).cloned()
    }

    /// Operand stack depth in slots.
    pub fn stack_depth(&self, arena: &Arena) -> usize {
        let base = offset(self.fp, self.stack_offset(arena));
        self.sp.saturating_sub(base)
    }

    /// Render every slot of the frame, from the first parameter to `sp`.
    pub fn trace(&self, arena: &Arena, field: Option<&FieldInfo>) -> String {
        let mut out = String::new();
        let Some(method) = self.method_info(arena) else {
            let _ = writeln!(out, "frame @{:#x}: no method", self.fp);
            return out;
        };
        let _ = write!(out, "{method:?} pc: {}", self.pc);
        if let Some(field) = field {
            let _ = write!(out, " field: {field:?}");
        }
        out.push('\n');

        let argument_slots = method.consume_argument_slots() as isize;
        let start = self.argument_frame_pointer_offset(arena);
        let stack = self.stack_offset(arena);
        let end = self.sp as isize - self.fp as isize;
        for rel in start..end {
            let label = if rel < start + argument_slots {
                format!("P{}", rel - start)
            } else if rel == RETURN_PC_OFFSET {
                "RA".to_string()
            } else if rel == CALLER_FP_OFFSET {
                "CP".to_string()
            } else if rel == METHOD_INFO_OFFSET {
                "MI".to_string()
            } else if rel < stack {
                format!("L{rel}")
            } else {
                format!("S{}", rel - stack)
            };
            let addr = offset(self.fp, rel);
            let reference = match arena.o4(addr) {
                Some(Reference::Object(obj)) => format!("{obj}"),
                Some(Reference::Method(m)) => format!("{m:?}"),
                Some(Reference::Class(c)) => c.name.clone(),
                None => "-".to_string(),
            };
            let _ = writeln!(
                out,
                "{label:>4} {rel:>4} {addr:#08x} {:>12} {reference}",
                arena.i4(addr)
            );
        }
        out
    }
}
