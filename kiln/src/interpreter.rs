use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::{
    Arena, ClassRef, ConstantPool, ConstantTag, Context, ElementType, Fault, FrameView,
    HeldMonitor, Kind, LockTarget, MARKER_PC, MethodRef, Object, ObjectData, ObjectRef, Opcode,
    Reference, Thread, Value, VmError, VmResult,
    bytecode::{branch_target, switch_padding},
    frame::{self, FRAME_HEADER_SLOTS, offset},
};

#[cfg(test)]
mod tests;

/// How a call to [`interpret`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The host entry frame returned.
    Returned(Option<Value>),
    /// The thread blocked on a monitor. Its cursors point at the blocking
    /// instruction; resume to retry it.
    Suspended,
}

enum Flow {
    Continue,
    Return(Option<Value>),
    Suspend,
}

/// Execute the thread's current frame until its host entry frame returns,
/// the thread suspends, or an exception escapes.
pub fn interpret(thread: &mut Thread) -> VmResult<Completion> {
    if thread.is_empty() {
        return Err(VmError::NoFrame);
    }
    let context = thread.context().clone();
    let arena = context.arena().lock();
    let mut interpreter = Interpreter::new(&context, arena, thread)?;
    interpreter.run()
}

struct Interpreter<'a> {
    context: &'a Context,
    arena: MutexGuard<'a, Arena>,
    thread: &'a mut Thread,
    fp: usize,
    sp: usize,
    pc: usize,
    /// Start of the instruction being executed.
    op_pc: usize,
    method: MethodRef,
    /// Argument slots of `method` including the receiver.
    argument_slots: usize,
    /// Non-argument locals of `method`.
    locals: usize,
}

impl<'a> Interpreter<'a> {
    fn new(
        context: &'a Context,
        arena: MutexGuard<'a, Arena>,
        thread: &'a mut Thread,
    ) -> VmResult<Self> {
        let view = thread.frame();
        let method = view.method_info(&arena).ok_or(VmError::NoFrame)?;
        let mut interpreter = Self {
            context,
            arena,
            fp: thread.fp,
            sp: thread.sp,
            pc: thread.pc,
            op_pc: thread.pc,
            thread,
            argument_slots: 0,
            locals: 0,
            method: method.clone(),
        };
        interpreter.bind_method(method);
        Ok(interpreter)
    }

    fn bind_method(&mut self, method: MethodRef) {
        self.argument_slots = method.consume_argument_slots();
        self.locals = method.max_locals - self.argument_slots;
        self.method = method;
    }

    fn frame_view(&self) -> FrameView {
        FrameView::new(self.fp, self.sp, self.pc)
    }

    fn sync_thread(&mut self) {
        self.thread.save(self.fp, self.sp, self.pc);
    }

    fn run(&mut self) -> VmResult<Completion> {
        loop {
            if log::log_enabled!(log::Level::Trace) {
                log::trace!("{}", self.frame_view().trace(&self.arena, None));
            }
            let flow = match self.step() {
                Ok(flow) => flow,
                Err(VmError::Exception(exception)) => self.unwind(exception)?,
                Err(err) => {
                    self.abandon();
                    return Err(err);
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Return(value) => return Ok(Completion::Returned(value)),
                Flow::Suspend => {
                    self.pc = self.op_pc;
                    self.sync_thread();
                    log::debug!("thread {} suspended at pc {}", self.thread.id().0, self.pc);
                    return Ok(Completion::Suspended);
                }
            }
        }
    }

    // ── code stream ────────────────────────────────────────────────

    fn code_bounds(&self) -> VmError {
        VmError::CodeBounds {
            method: self.method.impl_key().to_string(),
            pc: self.pc,
        }
    }

    fn read_u8(&mut self) -> VmResult<u8> {
        let byte = self
            .method
            .code
            .get(self.pc)
            .copied()
            .ok_or_else(|| self.code_bounds())?;
        self.pc += 1;
        Ok(byte)
    }

    fn read_bytes<const N: usize>(&mut self) -> VmResult<[u8; N]> {
        let bytes = self
            .method
            .code
            .get(self.pc..self.pc + N)
            .and_then(|b| <[u8; N]>::try_from(b).ok())
            .ok_or_else(|| self.code_bounds())?;
        self.pc += N;
        Ok(bytes)
    }

    fn read_i8(&mut self) -> VmResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16(&mut self) -> VmResult<u16> {
        Ok(u16::from_be_bytes(self.read_bytes()?))
    }

    fn read_i16(&mut self) -> VmResult<i16> {
        Ok(i16::from_be_bytes(self.read_bytes()?))
    }

    fn read_i32(&mut self) -> VmResult<i32> {
        Ok(i32::from_be_bytes(self.read_bytes()?))
    }

    fn pool(&self) -> VmResult<Arc<dyn ConstantPool>> {
        Ok(self.method.class.constant_pool()?.clone())
    }

    // ── operand stack ──────────────────────────────────────────────

    fn push_i4(&mut self, value: i32) {
        self.arena.set_i4(self.sp, value);
        self.sp += 1;
    }

    fn pop_i4(&mut self) -> i32 {
        self.sp -= 1;
        self.arena.i4(self.sp)
    }

    fn push_f4(&mut self, value: f32) {
        self.arena.set_f4(self.sp, value);
        self.sp += 1;
    }

    fn pop_f4(&mut self) -> f32 {
        self.sp -= 1;
        self.arena.f4(self.sp)
    }

    fn push_i8(&mut self, value: i64) {
        self.arena.set_i8(self.sp, value);
        self.sp += 2;
    }

    fn pop_i8(&mut self) -> i64 {
        self.sp -= 2;
        self.arena.i8(self.sp)
    }

    fn push_f8(&mut self, value: f64) {
        self.arena.set_f8(self.sp, value);
        self.sp += 2;
    }

    fn pop_f8(&mut self) -> f64 {
        self.sp -= 2;
        self.arena.f8(self.sp)
    }

    fn push_o4(&mut self, value: Option<ObjectRef>) {
        self.arena.set_o4(self.sp, value.map(Reference::Object));
        self.sp += 1;
    }

    fn pop_o4(&mut self) -> Option<ObjectRef> {
        self.sp -= 1;
        match self.arena.take_o4(self.sp) {
            Some(Reference::Object(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Pop a reference, raising `NullPointerException` for null.
    fn pop_object(&mut self) -> VmResult<ObjectRef> {
        match self.pop_o4() {
            Some(obj) => Ok(obj),
            None => Err(self.context.throw(Fault::NullPointer, None)),
        }
    }

    fn push_value(&mut self, value: Value) {
        match value {
            Value::Int(v) => self.push_i4(v),
            Value::Float(v) => self.push_f4(v),
            Value::Long(v) => self.push_i8(v),
            Value::Double(v) => self.push_f8(v),
            Value::Reference(v) => self.push_o4(v),
        }
    }

    fn pop_value(&mut self, kind: Kind) -> VmResult<Value> {
        Ok(match kind.stack_kind() {
            Kind::Int => Value::Int(self.pop_i4()),
            Kind::Float => Value::Float(self.pop_f4()),
            Kind::Long => Value::Long(self.pop_i8()),
            Kind::Double => Value::Double(self.pop_f8()),
            Kind::Reference => Value::Reference(self.pop_o4()),
            _ => {
                return Err(VmError::TypeMismatch {
                    expected: "value kind",
                    got: format!("{kind:?}"),
                });
            }
        })
    }

    /// Rewrite the top `count` slots (both shadows) as `pattern`, indices
    /// counted from the deepest of them.
    fn shuffle(&mut self, count: usize, pattern: &[usize]) {
        let base = self.sp - count;
        let saved: Vec<(i32, Option<Reference>)> = (base..self.sp)
            .map(|addr| (self.arena.i4(addr), self.arena.o4(addr).cloned()))
            .collect();
        for (i, from) in pattern.iter().enumerate() {
            let (value, reference) = saved[*from].clone();
            self.arena.set_i4(base + i, value);
            self.arena.set_o4(base + i, reference);
        }
        self.sp = base + pattern.len();
    }

    // ── locals ─────────────────────────────────────────────────────

    fn local_addr(&self, index: u16) -> usize {
        offset(
            self.fp,
            frame::local_frame_pointer_offset(index as usize, self.argument_slots),
        )
    }

    fn load_local(&mut self, kind: Kind, index: u16) {
        let addr = self.local_addr(index);
        match kind {
            Kind::Long | Kind::Double => {
                let value = self.arena.i8(addr);
                self.push_i8(value);
            }
            Kind::Reference => {
                let value = self.arena.object(addr);
                self.push_o4(value);
            }
            _ => {
                let value = self.arena.i4(addr);
                self.push_i4(value);
            }
        }
    }

    fn store_local(&mut self, kind: Kind, index: u16) {
        let addr = self.local_addr(index);
        match kind {
            Kind::Long | Kind::Double => {
                let value = self.pop_i8();
                self.arena.set_i8(addr, value);
            }
            Kind::Reference => {
                self.sp -= 1;
                let value = self.arena.take_o4(self.sp);
                self.arena.set_o4(addr, value);
            }
            _ => {
                let value = self.pop_i4();
                self.arena.set_i4(addr, value);
            }
        }
    }

    fn iinc(&mut self, index: u16, delta: i32) {
        let addr = self.local_addr(index);
        let value = self.arena.i4(addr).wrapping_add(delta);
        self.arena.set_i4(addr, value);
    }

    // ── arithmetic helpers ─────────────────────────────────────────

    fn int_op(&mut self, f: impl FnOnce(i32, i32) -> i32) {
        let b = self.pop_i4();
        let a = self.pop_i4();
        self.push_i4(f(a, b));
    }

    fn long_op(&mut self, f: impl FnOnce(i64, i64) -> i64) {
        let b = self.pop_i8();
        let a = self.pop_i8();
        self.push_i8(f(a, b));
    }

    fn long_shift(&mut self, f: impl FnOnce(i64, u32) -> i64) {
        let b = self.pop_i4();
        let a = self.pop_i8();
        self.push_i8(f(a, b as u32));
    }

    fn float_op(&mut self, f: impl FnOnce(f32, f32) -> f32) {
        let b = self.pop_f4();
        let a = self.pop_f4();
        self.push_f4(f(a, b));
    }

    fn double_op(&mut self, f: impl FnOnce(f64, f64) -> f64) {
        let b = self.pop_f8();
        let a = self.pop_f8();
        self.push_f8(f(a, b));
    }

    fn int_division(&mut self, f: impl FnOnce(i32, i32) -> i32) -> VmResult<()> {
        let b = self.pop_i4();
        let a = self.pop_i4();
        if b == 0 {
            return Err(self
                .context
                .throw(Fault::Arithmetic, Some("/ by zero".into())));
        }
        self.push_i4(f(a, b));
        Ok(())
    }

    fn long_division(&mut self, f: impl FnOnce(i64, i64) -> i64) -> VmResult<()> {
        let b = self.pop_i8();
        let a = self.pop_i8();
        if b == 0 {
            return Err(self
                .context
                .throw(Fault::Arithmetic, Some("/ by zero".into())));
        }
        self.push_i8(f(a, b));
        Ok(())
    }

    // ── branches ───────────────────────────────────────────────────

    /// Jump relative to the current instruction.
    fn jump(&mut self, offset: i32) -> VmResult<()> {
        let target = branch_target(self.op_pc + 1, offset);
        if target < 0 || target as usize >= self.method.code.len() {
            return Err(VmError::BranchTarget {
                method: self.method.impl_key().to_string(),
                target,
            });
        }
        self.pc = target as usize;
        Ok(())
    }

    fn branch_if(&mut self, condition: bool) -> VmResult<()> {
        let offset = self.read_i16()? as i32;
        if condition {
            self.jump(offset)?;
        }
        Ok(())
    }

    fn if_int(&mut self, f: impl FnOnce(i32) -> bool) -> VmResult<()> {
        let value = self.pop_i4();
        self.branch_if(f(value))
    }

    fn if_int_compare(&mut self, f: impl FnOnce(i32, i32) -> bool) -> VmResult<()> {
        let b = self.pop_i4();
        let a = self.pop_i4();
        self.branch_if(f(a, b))
    }

    fn if_reference_compare(&mut self, equal: bool) -> VmResult<()> {
        let b = self.pop_o4();
        let a = self.pop_o4();
        let same = match (a, b) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            (None, None) => true,
            _ => false,
        };
        self.branch_if(same == equal)
    }

    fn table_switch(&mut self) -> VmResult<()> {
        self.pc += switch_padding(self.op_pc);
        let default = self.read_i32()?;
        let low = self.read_i32()?;
        let high = self.read_i32()?;
        let key = self.pop_i4();
        if key < low || key > high {
            return self.jump(default);
        }
        self.pc += 4 * (key as i64 - low as i64) as usize;
        let offset = self.read_i32()?;
        self.jump(offset)
    }

    fn lookup_switch(&mut self) -> VmResult<()> {
        self.pc += switch_padding(self.op_pc);
        let default = self.read_i32()?;
        let pairs = self.read_i32()?.max(0);
        let key = self.pop_i4();
        for _ in 0..pairs {
            let candidate = self.read_i32()?;
            let offset = self.read_i32()?;
            if candidate == key {
                return self.jump(offset);
            }
        }
        self.jump(default)
    }

    // ── arrays ─────────────────────────────────────────────────────

    fn array_index(&self, array: &ObjectRef, index: i32) -> VmResult<usize> {
        let length = array.array_length().ok_or_else(|| VmError::TypeMismatch {
            expected: "array",
            got: array.class.name.clone(),
        })?;
        if index < 0 || index as usize >= length {
            return Err(self
                .context
                .throw(Fault::ArrayIndexOutOfBounds, Some(index.to_string())));
        }
        Ok(index as usize)
    }

    fn array_load(&mut self, kind: Kind) -> VmResult<()> {
        let index = self.pop_i4();
        let array = self.pop_object()?;
        let index = self.array_index(&array, index)?;
        let value = match &*array.data() {
            ObjectData::Array(data) => data.load(index),
            _ => Value::NULL,
        };
        if value.kind() != kind {
            return Err(VmError::TypeMismatch {
                expected: "array element of the loaded kind",
                got: format!("{value:?}"),
            });
        }
        self.push_value(value);
        Ok(())
    }

    fn array_store(&mut self, kind: Kind) -> VmResult<()> {
        let value = self.pop_value(kind)?;
        let index = self.pop_i4();
        let array = self.pop_object()?;
        let index = self.array_index(&array, index)?;
        if let (Some(ElementType::Reference(element)), Value::Reference(Some(obj))) =
            (&array.class.element, &value)
        {
            if !obj.class.is_assignable_to(element) {
                return Err(self
                    .context
                    .throw(Fault::ArrayStore, Some(obj.class.name.clone())));
            }
        }
        if let ObjectData::Array(data) = &mut *array.data() {
            data.store(index, value)?;
        }
        Ok(())
    }

    fn new_array(&mut self, class: &ClassRef, length: i32) -> VmResult<ObjectRef> {
        if length < 0 {
            return Err(self
                .context
                .throw(Fault::NegativeArraySize, Some(length.to_string())));
        }
        Object::new_array(class, length as usize)
    }

    fn new_multi_array(&mut self, class: &ClassRef, lengths: &[i32]) -> VmResult<ObjectRef> {
        let array = self.new_array(class, lengths[0])?;
        if let (Some(ElementType::Reference(component)), [_, rest @ ..]) = (&class.element, lengths)
        {
            if !rest.is_empty() && component.is_array() {
                for i in 0..lengths[0] as usize {
                    let sub = self.new_multi_array(component, rest)?;
                    if let ObjectData::Array(data) = &mut *array.data() {
                        data.store(i, Value::from(sub))?;
                    }
                }
            }
        }
        Ok(array)
    }

    // ── calls ──────────────────────────────────────────────────────

    fn pop_arguments(&mut self, callee: &MethodRef) -> VmResult<Vec<Value>> {
        let kinds = &callee.descriptor.arguments;
        let mut args = Vec::with_capacity(kinds.len() + 1);
        for kind in kinds.iter().rev() {
            args.push(self.pop_value(*kind)?);
        }
        if !callee.is_static() {
            args.push(Value::Reference(self.pop_o4()));
        }
        args.reverse();
        Ok(args)
    }

    fn push_result(&mut self, callee: &MethodRef, result: Option<Value>) -> VmResult<()> {
        match (callee.return_kind(), result) {
            (Kind::Void, _) => Ok(()),
            (kind, Some(value)) => {
                self.push_value(value.narrow(kind));
                Ok(())
            }
            (kind, None) => Err(VmError::TypeMismatch {
                expected: "return value",
                got: format!("nothing from {callee:?} returning {kind:?}"),
            }),
        }
    }

    fn invoke(&mut self, op: Opcode) -> VmResult<Flow> {
        let index = self.read_u16()?;
        if op == Opcode::Invokeinterface {
            self.pc += 2;
        }
        let is_static = op == Opcode::Invokestatic;
        let resolved = self.pool()?.resolve_method(index, is_static)?;

        if is_static {
            return self.call(resolved, None);
        }
        let receiver_addr = self.sp - resolved.argument_slots() - 1;
        let Some(receiver) = self.arena.object(receiver_addr) else {
            return Err(self
                .context
                .throw(Fault::NullPointer, Some(format!("invoking {resolved:?}"))));
        };
        let no_such_method = || VmError::NoSuchMethod {
            class: receiver.class.name.clone(),
            method: resolved.impl_key().to_string(),
        };
        let callee = match op {
            Opcode::Invokevirtual => match resolved.vtable_index {
                Some(slot) => receiver
                    .class
                    .virtual_method(slot)
                    .ok_or_else(no_such_method)?,
                None => resolved.clone(),
            },
            Opcode::Invokeinterface => receiver
                .class
                .interface_method(&resolved.name, &resolved.signature)
                .ok_or_else(no_such_method)?,
            _ => resolved.clone(),
        };
        self.call(callee, Some(receiver))
    }

    fn call(&mut self, callee: MethodRef, receiver: Option<ObjectRef>) -> VmResult<Flow> {
        if callee.is_abstract() {
            return Err(VmError::AbstractMethod(callee.impl_key().to_string()));
        }
        if callee.name == "<init>" && callee.class.super_class.is_none() {
            // Object.<init> does nothing
            self.pop_o4();
            return Ok(Flow::Continue);
        }
        if callee.is_native() {
            let native = self.context.natives().resolve(&callee)?;
            let args = self.pop_arguments(&callee)?;
            self.sync_thread();
            let thread = &mut *self.thread;
            let result = MutexGuard::unlocked(&mut self.arena, || native(thread, &args))?;
            self.push_result(&callee, result)?;
            return Ok(Flow::Continue);
        }

        let count = callee.record_invocation();
        let compiled = !callee.is_synchronized()
            && (!self.context.compiled().is_empty()
                || count >= self.context.jit().hot_method_threshold);
        if let Some(unit) = compiled.then(|| self.context.compiled_for(&callee)).flatten() {
            let args = self.pop_arguments(&callee)?;
            self.sync_thread();
            let context = self.context;
            let result = MutexGuard::unlocked(&mut self.arena, || {
                context.call_compiled(&unit, &callee, &args)
            })?;
            self.push_result(&callee, result)?;
            return Ok(Flow::Continue);
        }

        let fp = self.sp + FRAME_HEADER_SLOTS;
        let callee_locals = callee.max_locals - callee.consume_argument_slots();
        if fp + callee_locals + callee.max_stack > self.thread.limit {
            return Err(self.context.throw(Fault::StackOverflow, None));
        }

        let lock = if callee.is_synchronized() {
            let target = match receiver {
                Some(obj) => LockTarget::Object(obj),
                None => LockTarget::Class(callee.class.clone()),
            };
            if !target.monitor().try_enter(self.thread.id()) {
                return Ok(Flow::Suspend);
            }
            Some(target)
        } else {
            None
        };

        self.arena.set_i4(self.sp, self.pc as i32);
        self.arena.set_i4(self.sp + 1, self.fp as i32);
        self.arena
            .set_o4(self.sp + 2, Some(Reference::Method(callee.clone())));
        log::trace!("call {callee:?} fp {fp} from {:?}@{}", self.method, self.op_pc);
        self.fp = fp;
        self.sp = fp + callee_locals;
        self.pc = 0;
        if let Some(target) = lock {
            self.thread.monitors.push(HeldMonitor { fp, target });
        }
        self.bind_method(callee);
        Ok(Flow::Continue)
    }

    fn release_frame_monitors(&mut self) {
        let id = self.thread.id();
        while let Some(held) = self.thread.monitors.last() {
            if held.fp != self.fp {
                break;
            }
            held.target.monitor().exit(id);
            self.thread.monitors.pop();
        }
    }

    /// Discard the current frame. Returns `false` if it was a host entry
    /// frame, in which case the thread cursors have been restored.
    fn pop_frame(&mut self) -> bool {
        self.release_frame_monitors();
        let view = self.frame_view();
        let return_pc = view.return_pc(&self.arena);
        let caller_fp = view.caller_fp(&self.arena);
        let parameters = offset(
            self.fp,
            frame::argument_frame_pointer_offset(self.argument_slots),
        );
        for addr in parameters..self.sp {
            self.arena.set_o4(addr, None);
        }

        if return_pc == MARKER_PC {
            let sp = if parameters == self.thread.bp {
                self.thread.bp - 1
            } else {
                parameters
            };
            self.thread.save(caller_fp, sp, 0);
            return false;
        }

        self.fp = caller_fp;
        self.sp = parameters;
        self.pc = return_pc as usize;
        if let Some(method) = FrameView::new(self.fp, self.sp, self.pc).method_info(&self.arena) {
            self.bind_method(method);
        }
        true
    }

    /// Drop every frame up to and including the host entry frame after an
    /// error that no handler can catch, releasing their monitors.
    fn abandon(&mut self) {
        log::debug!("abandoning frames of {:?} at pc {}", self.method, self.op_pc);
        while self.pop_frame() {}
    }

    fn do_return(&mut self, value: Option<Value>) -> Flow {
        log::trace!("return from {:?}", self.method);
        if !self.pop_frame() {
            return Flow::Return(value);
        }
        if let Some(value) = value {
            self.push_value(value);
        }
        Flow::Continue
    }

    fn find_handler(&self, exception: &ObjectRef, pc: usize) -> Option<usize> {
        self.method
            .exception_handlers
            .iter()
            .find(|h| {
                h.covers(pc)
                    && h.catch_type
                        .as_ref()
                        .is_none_or(|c| exception.class.is_assignable_to(c))
            })
            .map(|h| h.handler_pc)
    }

    /// Transfer control to the nearest handler of `exception`, popping
    /// frames until one is found or the host entry frame is left.
    fn unwind(&mut self, exception: ObjectRef) -> VmResult<Flow> {
        let mut pc = self.op_pc;
        loop {
            if let Some(handler) = self.find_handler(&exception, pc) {
                log::debug!("{exception} caught in {:?} at {handler}", self.method);
                let stack = offset(self.fp, self.locals as isize);
                for addr in stack..self.sp {
                    self.arena.set_o4(addr, None);
                }
                self.sp = stack;
                self.push_o4(Some(exception));
                self.pc = handler;
                return Ok(Flow::Continue);
            }
            if !self.pop_frame() {
                return Err(VmError::Exception(exception));
            }
            // the invoke instruction that created the popped frame
            pc = self.pc - 1;
        }
    }

    // ── dispatch ───────────────────────────────────────────────────

    fn step(&mut self) -> VmResult<Flow> {
        use Opcode::*;

        self.op_pc = self.pc;
        let byte = self.read_u8()?;
        let op = Opcode::try_from(byte).map_err(|opcode| VmError::UnknownOpcode {
            opcode,
            pc: self.op_pc,
        })?;

        match op {
            Nop => {}
            AconstNull => self.push_o4(None),
            IconstM1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 => {
                self.push_i4(op as i32 - Iconst0 as i32)
            }
            Lconst0 | Lconst1 => self.push_i8((op as u8 - Lconst0 as u8) as i64),
            Fconst0 | Fconst1 | Fconst2 => self.push_f4((op as u8 - Fconst0 as u8) as f32),
            Dconst0 | Dconst1 => self.push_f8((op as u8 - Dconst0 as u8) as f64),
            Bipush => {
                let value = self.read_i8()?;
                self.push_i4(value as i32);
            }
            Sipush => {
                let value = self.read_i16()?;
                self.push_i4(value as i32);
            }
            Ldc | LdcW | Ldc2W => {
                let index = match op {
                    Ldc => self.read_u8()? as u16,
                    _ => self.read_u16()?,
                };
                let value = self.pool()?.resolve(index, ConstantTag::Any, false)?;
                if value.kind().is_two_slot() != (op == Ldc2W) {
                    return Err(VmError::ConstantPool {
                        index,
                        expected: ConstantTag::Any,
                    });
                }
                self.push_value(value);
            }

            Iload | Lload | Fload | Dload | Aload => {
                let index = self.read_u8()? as u16;
                self.load_local(load_kind(op), index);
            }
            Iload0 | Iload1 | Iload2 | Iload3 => {
                self.load_local(Kind::Int, short_index(op, Iload0))
            }
            Lload0 | Lload1 | Lload2 | Lload3 => {
                self.load_local(Kind::Long, short_index(op, Lload0))
            }
            Fload0 | Fload1 | Fload2 | Fload3 => {
                self.load_local(Kind::Float, short_index(op, Fload0))
            }
            Dload0 | Dload1 | Dload2 | Dload3 => {
                self.load_local(Kind::Double, short_index(op, Dload0))
            }
            Aload0 | Aload1 | Aload2 | Aload3 => {
                self.load_local(Kind::Reference, short_index(op, Aload0))
            }
            Istore | Lstore | Fstore | Dstore | Astore => {
                let index = self.read_u8()? as u16;
                self.store_local(store_kind(op), index);
            }
            Istore0 | Istore1 | Istore2 | Istore3 => {
                self.store_local(Kind::Int, short_index(op, Istore0))
            }
            Lstore0 | Lstore1 | Lstore2 | Lstore3 => {
                self.store_local(Kind::Long, short_index(op, Lstore0))
            }
            Fstore0 | Fstore1 | Fstore2 | Fstore3 => {
                self.store_local(Kind::Float, short_index(op, Fstore0))
            }
            Dstore0 | Dstore1 | Dstore2 | Dstore3 => {
                self.store_local(Kind::Double, short_index(op, Dstore0))
            }
            Astore0 | Astore1 | Astore2 | Astore3 => {
                self.store_local(Kind::Reference, short_index(op, Astore0))
            }
            Iinc => {
                let index = self.read_u8()? as u16;
                let delta = self.read_i8()? as i32;
                self.iinc(index, delta);
            }
            Wide => {
                let wide_pc = self.pc;
                let inner = self.read_u8()?;
                let inner = Opcode::try_from(inner).map_err(|opcode| VmError::UnknownOpcode {
                    opcode,
                    pc: wide_pc,
                })?;
                let index = self.read_u16()?;
                match inner {
                    Iload | Lload | Fload | Dload | Aload => {
                        self.load_local(load_kind(inner), index)
                    }
                    Istore | Lstore | Fstore | Dstore | Astore => {
                        self.store_local(store_kind(inner), index)
                    }
                    Iinc => {
                        let delta = self.read_i16()? as i32;
                        self.iinc(index, delta);
                    }
                    other => return Err(VmError::Unsupported(other)),
                }
            }

            Iaload => self.array_load(Kind::Int)?,
            Laload => self.array_load(Kind::Long)?,
            Faload => self.array_load(Kind::Float)?,
            Daload => self.array_load(Kind::Double)?,
            Aaload => self.array_load(Kind::Reference)?,
            Baload | Caload | Saload => self.array_load(Kind::Int)?,
            Iastore | Bastore | Castore | Sastore => self.array_store(Kind::Int)?,
            Lastore => self.array_store(Kind::Long)?,
            Fastore => self.array_store(Kind::Float)?,
            Dastore => self.array_store(Kind::Double)?,
            Aastore => self.array_store(Kind::Reference)?,

            Pop => {
                self.sp -= 1;
                self.arena.set_o4(self.sp, None);
            }
            Pop2 => {
                self.sp -= 2;
                self.arena.set_o4(self.sp, None);
                self.arena.set_o4(self.sp + 1, None);
            }
            Dup => {
                self.arena.copy_slot(self.sp - 1, self.sp);
                self.sp += 1;
            }
            DupX1 => self.shuffle(2, &[1, 0, 1]),
            DupX2 => self.shuffle(3, &[2, 0, 1, 2]),
            Dup2 => self.shuffle(2, &[0, 1, 0, 1]),
            Dup2X1 => self.shuffle(3, &[1, 2, 0, 1, 2]),
            Dup2X2 => self.shuffle(4, &[2, 3, 0, 1, 2, 3]),
            Swap => self.shuffle(2, &[1, 0]),

            Iadd => self.int_op(i32::wrapping_add),
            Ladd => self.long_op(i64::wrapping_add),
            Fadd => self.float_op(|a, b| a + b),
            Dadd => self.double_op(|a, b| a + b),
            Isub => self.int_op(i32::wrapping_sub),
            Lsub => self.long_op(i64::wrapping_sub),
            Fsub => self.float_op(|a, b| a - b),
            Dsub => self.double_op(|a, b| a - b),
            Imul => self.int_op(i32::wrapping_mul),
            Lmul => self.long_op(i64::wrapping_mul),
            Fmul => self.float_op(|a, b| a * b),
            Dmul => self.double_op(|a, b| a * b),
            Idiv => self.int_division(i32::wrapping_div)?,
            Ldiv => self.long_division(i64::wrapping_div)?,
            Fdiv => self.float_op(|a, b| a / b),
            Ddiv => self.double_op(|a, b| a / b),
            Irem => self.int_division(i32::wrapping_rem)?,
            Lrem => self.long_division(i64::wrapping_rem)?,
            Frem => self.float_op(|a, b| a % b),
            Drem => self.double_op(|a, b| a % b),
            Ineg => {
                let v = self.pop_i4();
                self.push_i4(v.wrapping_neg());
            }
            Lneg => {
                let v = self.pop_i8();
                self.push_i8(v.wrapping_neg());
            }
            Fneg => {
                let v = self.pop_f4();
                self.push_f4(-v);
            }
            Dneg => {
                let v = self.pop_f8();
                self.push_f8(-v);
            }
            Ishl => self.int_op(|a, b| a.wrapping_shl(b as u32)),
            Lshl => self.long_shift(i64::wrapping_shl),
            Ishr => self.int_op(|a, b| a.wrapping_shr(b as u32)),
            Lshr => self.long_shift(i64::wrapping_shr),
            Iushr => self.int_op(|a, b| (a as u32).wrapping_shr(b as u32) as i32),
            Lushr => self.long_shift(|a, b| (a as u64).wrapping_shr(b) as i64),
            Iand => self.int_op(|a, b| a & b),
            Land => self.long_op(|a, b| a & b),
            Ior => self.int_op(|a, b| a | b),
            Lor => self.long_op(|a, b| a | b),
            Ixor => self.int_op(|a, b| a ^ b),
            Lxor => self.long_op(|a, b| a ^ b),

            I2l => {
                let v = self.pop_i4();
                self.push_i8(v as i64);
            }
            I2f => {
                let v = self.pop_i4();
                self.push_f4(v as f32);
            }
            I2d => {
                let v = self.pop_i4();
                self.push_f8(v as f64);
            }
            L2i => {
                let v = self.pop_i8();
                self.push_i4(v as i32);
            }
            L2f => {
                let v = self.pop_i8();
                self.push_f4(v as f32);
            }
            L2d => {
                let v = self.pop_i8();
                self.push_f8(v as f64);
            }
            F2i => {
                let v = self.pop_f4();
                self.push_i4(v as i32);
            }
            F2l => {
                let v = self.pop_f4();
                self.push_i8(v as i64);
            }
            F2d => {
                let v = self.pop_f4();
                self.push_f8(v as f64);
            }
            D2i => {
                let v = self.pop_f8();
                self.push_i4(v as i32);
            }
            D2l => {
                let v = self.pop_f8();
                self.push_i8(v as i64);
            }
            D2f => {
                let v = self.pop_f8();
                self.push_f4(v as f32);
            }
            I2b => {
                let v = self.pop_i4();
                self.push_i4(v as i8 as i32);
            }
            I2c => {
                let v = self.pop_i4();
                self.push_i4(v as u16 as i32);
            }
            I2s => {
                let v = self.pop_i4();
                self.push_i4(v as i16 as i32);
            }

            Lcmp => {
                let b = self.pop_i8();
                let a = self.pop_i8();
                self.push_i4(a.cmp(&b) as i32);
            }
            Fcmpl | Fcmpg => {
                let b = self.pop_f4() as f64;
                let a = self.pop_f4() as f64;
                self.push_i4(compare_floats(a, b, if op == Fcmpl { -1 } else { 1 }));
            }
            Dcmpl | Dcmpg => {
                let b = self.pop_f8();
                let a = self.pop_f8();
                self.push_i4(compare_floats(a, b, if op == Dcmpl { -1 } else { 1 }));
            }

            Ifeq => self.if_int(|v| v == 0)?,
            Ifne => self.if_int(|v| v != 0)?,
            Iflt => self.if_int(|v| v < 0)?,
            Ifge => self.if_int(|v| v >= 0)?,
            Ifgt => self.if_int(|v| v > 0)?,
            Ifle => self.if_int(|v| v <= 0)?,
            IfIcmpeq => self.if_int_compare(|a, b| a == b)?,
            IfIcmpne => self.if_int_compare(|a, b| a != b)?,
            IfIcmplt => self.if_int_compare(|a, b| a < b)?,
            IfIcmpge => self.if_int_compare(|a, b| a >= b)?,
            IfIcmpgt => self.if_int_compare(|a, b| a > b)?,
            IfIcmple => self.if_int_compare(|a, b| a <= b)?,
            IfAcmpeq => self.if_reference_compare(true)?,
            IfAcmpne => self.if_reference_compare(false)?,
            Ifnull | Ifnonnull => {
                let value = self.pop_o4();
                self.branch_if(value.is_none() == (op == Ifnull))?;
            }
            Goto => {
                let offset = self.read_i16()? as i32;
                self.jump(offset)?;
            }
            GotoW => {
                let offset = self.read_i32()?;
                self.jump(offset)?;
            }
            Tableswitch => self.table_switch()?,
            Lookupswitch => self.lookup_switch()?,

            Ireturn => {
                let v = self.pop_i4();
                let value = Value::Int(v).narrow(self.method.return_kind());
                return Ok(self.do_return(Some(value)));
            }
            Lreturn => {
                let v = self.pop_i8();
                return Ok(self.do_return(Some(Value::Long(v))));
            }
            Freturn => {
                let v = self.pop_f4();
                return Ok(self.do_return(Some(Value::Float(v))));
            }
            Dreturn => {
                let v = self.pop_f8();
                return Ok(self.do_return(Some(Value::Double(v))));
            }
            Areturn => {
                let v = self.pop_o4();
                return Ok(self.do_return(Some(Value::Reference(v))));
            }
            Return => return Ok(self.do_return(None)),

            Getstatic => {
                let index = self.read_u16()?;
                let field = self.pool()?.resolve_field(index, true)?;
                let value = field.get_static()?;
                self.push_value(value);
            }
            Putstatic => {
                let index = self.read_u16()?;
                let field = self.pool()?.resolve_field(index, true)?;
                let value = self.pop_value(field.kind)?;
                field.set_static(value)?;
            }
            Getfield => {
                let index = self.read_u16()?;
                let field = self.pool()?.resolve_field(index, false)?;
                let obj = self.pop_object()?;
                let value = field.get(&obj)?;
                self.push_value(value);
            }
            Putfield => {
                let index = self.read_u16()?;
                let field = self.pool()?.resolve_field(index, false)?;
                let value = self.pop_value(field.kind)?;
                let obj = self.pop_object()?;
                field.set(&obj, value)?;
            }

            Invokevirtual | Invokespecial | Invokestatic | Invokeinterface => {
                return self.invoke(op);
            }

            New => {
                let index = self.read_u16()?;
                let class = self.pool()?.resolve_class(index)?;
                self.push_o4(Some(Object::new_instance(&class)));
            }
            Newarray => {
                let code = self.read_u8()?;
                let element =
                    ElementType::from_array_type(code).ok_or_else(|| VmError::TypeMismatch {
                        expected: "array type code",
                        got: code.to_string(),
                    })?;
                let class = self.context.array_class(&element);
                let length = self.pop_i4();
                let array = self.new_array(&class, length)?;
                self.push_o4(Some(array));
            }
            Anewarray => {
                let index = self.read_u16()?;
                let component = self.pool()?.resolve_class(index)?;
                let class = self.context.array_class(&ElementType::Reference(component));
                let length = self.pop_i4();
                let array = self.new_array(&class, length)?;
                self.push_o4(Some(array));
            }
            Multianewarray => {
                let index = self.read_u16()?;
                let dimensions = self.read_u8()? as usize;
                let class = self.pool()?.resolve_class(index)?;
                let mut lengths = vec![0; dimensions.max(1)];
                for length in lengths.iter_mut().rev() {
                    *length = self.pop_i4();
                }
                if let Some(negative) = lengths.iter().find(|l| **l < 0) {
                    return Err(self
                        .context
                        .throw(Fault::NegativeArraySize, Some(negative.to_string())));
                }
                let array = self.new_multi_array(&class, &lengths)?;
                self.push_o4(Some(array));
            }
            Arraylength => {
                let array = self.pop_object()?;
                let length = array.array_length().ok_or_else(|| VmError::TypeMismatch {
                    expected: "array",
                    got: array.class.name.clone(),
                })?;
                self.push_i4(length as i32);
            }
            Athrow => {
                let exception = self.pop_object()?;
                return Err(VmError::Exception(exception));
            }
            Checkcast => {
                let index = self.read_u16()?;
                let class = self.pool()?.resolve_class(index)?;
                if let Some(obj) = self.arena.object(self.sp - 1) {
                    if !obj.class.is_assignable_to(&class) {
                        let message =
                            format!("{} cannot be cast to {}", obj.class.name, class.name);
                        return Err(self.context.throw(Fault::ClassCast, Some(message)));
                    }
                }
            }
            Instanceof => {
                let index = self.read_u16()?;
                let class = self.pool()?.resolve_class(index)?;
                let obj = self.pop_o4();
                let result = obj.is_some_and(|obj| obj.class.is_assignable_to(&class));
                self.push_i4(result as i32);
            }
            Monitorenter => {
                let obj = self.pop_object()?;
                if !obj.monitor().try_enter(self.thread.id()) {
                    self.push_o4(Some(obj));
                    return Ok(Flow::Suspend);
                }
                self.thread.monitors.push(HeldMonitor {
                    fp: self.fp,
                    target: LockTarget::Object(obj),
                });
            }
            Monitorexit => {
                let obj = self.pop_object()?;
                if !obj.monitor().exit(self.thread.id()) {
                    return Err(self.context.throw(Fault::IllegalMonitorState, None));
                }
                let fp = self.fp;
                let held = self.thread.monitors.iter().rposition(|h| {
                    h.fp == fp
                        && matches!(&h.target, LockTarget::Object(o) if Arc::ptr_eq(o, &obj))
                });
                if let Some(position) = held {
                    self.thread.monitors.remove(position);
                }
            }

            Jsr | Ret | JsrW | Invokedynamic => return Err(VmError::Unsupported(op)),
        }
        Ok(Flow::Continue)
    }
}

/// Local index encoded in a `xLOAD_n`/`xSTORE_n` opcode.
fn short_index(op: Opcode, base: Opcode) -> u16 {
    (op as u8 - base as u8) as u16
}

fn load_kind(op: Opcode) -> Kind {
    match op {
        Opcode::Lload => Kind::Long,
        Opcode::Fload => Kind::Float,
        Opcode::Dload => Kind::Double,
        Opcode::Aload => Kind::Reference,
        _ => Kind::Int,
    }
}

fn store_kind(op: Opcode) -> Kind {
    match op {
        Opcode::Lstore => Kind::Long,
        Opcode::Fstore => Kind::Float,
        Opcode::Dstore => Kind::Double,
        Opcode::Astore => Kind::Reference,
        _ => Kind::Int,
    }
}

/// `FCMPx`/`DCMPx` result; `nan` is pushed when either operand is NaN.
fn compare_floats(a: f64, b: f64, nan: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(ordering) => ordering as i32,
        None => nan,
    }
}
