use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    Arena, Completion, Context, Fault, FrameView, LockTarget, MARKER_PC, MethodRef, Reference,
    Value, VmError, VmResult, frame, interpret,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Slots reserved between the allocation base and the first frame.
pub const STACK_HEADER_SLOTS: usize = 64;

#[derive(Debug, Clone)]
pub struct ThreadCreateInfo {
    /// Stack size in slots, excluding the header reserve.
    pub stack_size: usize,
}

impl Default for ThreadCreateInfo {
    fn default() -> Self {
        Self {
            stack_size: 64 * 1024,
        }
    }
}

/// A monitor acquired by the frame at `fp`, released when that frame is
/// popped.
#[derive(Debug, Clone)]
pub struct HeldMonitor {
    pub fp: usize,
    pub target: LockTarget,
}

/// An interpreter thread: one arena region used as its call stack plus the
/// cursors describing the current frame.
pub struct Thread {
    id: ThreadId,
    context: Arc<Context>,
    /// Allocation base.
    pub tp: usize,
    /// Stack base, first slot usable by frames.
    pub bp: usize,
    /// One past the last slot of the region.
    pub limit: usize,
    pub fp: usize,
    pub sp: usize,
    pub pc: usize,
    pub monitors: Vec<HeldMonitor>,
}

impl Thread {
    pub fn new(context: &Arc<Context>, info: &ThreadCreateInfo) -> Self {
        let size = STACK_HEADER_SLOTS + info.stack_size;
        let tp = context.arena().lock().allocate(size);
        let bp = tp + STACK_HEADER_SLOTS;
        let id = ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!("thread {}: stack [{bp}, {})", id.0, tp + size);
        Self {
            id,
            context: context.clone(),
            tp,
            bp,
            limit: tp + size,
            fp: bp,
            // below the first frame
            sp: bp - 1,
            pc: 0,
            monitors: Vec::new(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// No frame is live.
    pub fn is_empty(&self) -> bool {
        self.sp < self.bp
    }

    pub fn frame(&self) -> FrameView {
        FrameView::new(self.fp, self.sp, self.pc)
    }

    pub fn save(&mut self, fp: usize, sp: usize, pc: usize) {
        self.fp = fp;
        self.sp = sp;
        self.pc = pc;
    }

    /// Push a host entry frame for `method` with `args` (receiver first for
    /// instance methods). The frame's return pc is [`MARKER_PC`], so
    /// returning from it leaves [`interpret`].
    ///
    /// Returns `false` without touching the stack if `method` is
    /// synchronized and its monitor is owned by another thread.
    pub fn enter(
        &mut self,
        arena: &mut Arena,
        method: &MethodRef,
        args: &[Value],
    ) -> VmResult<bool> {
        let slots = check_arguments(method, args)?;
        let base = if self.is_empty() { self.bp } else { self.sp };
        let fp = base + slots + frame::FRAME_HEADER_SLOTS;
        let locals = method.max_locals - method.consume_argument_slots();
        if fp + locals + method.max_stack > self.limit {
            return Err(self.context.throw(Fault::StackOverflow, None));
        }

        let lock = if method.is_synchronized() {
            let target = match args.first() {
                Some(Value::Reference(Some(receiver))) if !method.is_static() => {
                    LockTarget::Object(receiver.clone())
                }
                _ => LockTarget::Class(method.class.clone()),
            };
            if !target.monitor().try_enter(self.id) {
                log::debug!("thread {}: {method:?} is contended", self.id.0);
                return Ok(false);
            }
            Some(target)
        } else {
            None
        };

        let mut sp = base;
        for arg in args {
            match arg {
                Value::Int(v) => arena.set_i4(sp, *v),
                Value::Float(v) => arena.set_f4(sp, *v),
                Value::Long(v) => arena.set_i8(sp, *v),
                Value::Double(v) => arena.set_f8(sp, *v),
                Value::Reference(r) => arena.set_o4(sp, r.clone().map(Reference::Object)),
            }
            sp += arg.kind().slot_count();
        }
        arena.set_i4(sp, MARKER_PC);
        arena.set_i4(sp + 1, self.fp as i32);
        arena.set_o4(sp + 2, Some(Reference::Method(method.clone())));

        log::trace!("thread {}: enter {method:?} fp {fp}", self.id.0);
        self.save(fp, fp + locals, 0);
        if let Some(target) = lock {
            self.monitors.push(HeldMonitor { fp, target });
        }
        Ok(true)
    }

    /// Run `method` to completion from the host. A [`Completion::Suspended`]
    /// result with an unchanged stack means a synchronized `method` could
    /// not take its monitor; invoke it again later.
    pub fn invoke(&mut self, method: &MethodRef, args: &[Value]) -> VmResult<Completion> {
        if method.is_abstract() {
            return Err(VmError::AbstractMethod(method.impl_key().to_string()));
        }
        check_arguments(method, args)?;
        let context = self.context.clone();
        if method.is_native() {
            let native = context.natives().resolve(method)?;
            return native(self, args).map(Completion::Returned);
        }
        method.record_invocation();
        // generated code cannot take monitors
        let compiled = (!method.is_synchronized())
            .then(|| context.compiled_for(method))
            .flatten();
        if let Some(unit) = compiled {
            return context
                .call_compiled(&unit, method, args)
                .map(Completion::Returned);
        }

        let entered = {
            let mut arena = context.arena().lock();
            self.enter(&mut arena, method, args)?
        };
        if !entered {
            return Ok(Completion::Suspended);
        }
        interpret(self)
    }

    /// Continue a suspended thread.
    pub fn resume(&mut self) -> VmResult<Completion> {
        if self.is_empty() {
            return Err(VmError::NoFrame);
        }
        interpret(self)
    }
}

/// Slots taken by `args`, which must match what `method` consumes.
fn check_arguments(method: &MethodRef, args: &[Value]) -> VmResult<usize> {
    let slots: usize = args.iter().map(|v| v.kind().slot_count()).sum();
    if slots != method.consume_argument_slots() {
        return Err(VmError::TypeMismatch {
            expected: "argument slots matching the descriptor",
            got: format!("{slots} slots for {method:?}"),
        });
    }
    Ok(slots)
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("bp", &self.bp)
            .field("fp", &self.fp)
            .field("sp", &self.sp)
            .field("pc", &self.pc)
            .finish()
    }
}
