//! Fixtures shared by unit tests: a small context and a class with an
//! attached constant pool that bytecode under test can reference.

use std::sync::Arc;

use crate::{
    ArenaCreateInfo, ClassCreateInfo, ClassFlags, ClassInfo, ClassRef, Completion, Context,
    ContextCreateInfo, MethodCreateInfo, MethodFlags, MethodInfo, MethodRef, PoolEntry,
    StaticConstantPool, Thread, ThreadCreateInfo, Value, VmResult,
};

pub fn context() -> Arc<Context> {
    Context::new(&ContextCreateInfo {
        arena: ArenaCreateInfo { size: 1 << 16 },
        ..Default::default()
    })
}

pub struct World {
    pub context: Arc<Context>,
    pub class: ClassRef,
    pub pool: Arc<StaticConstantPool>,
}

impl World {
    pub fn new(context: &Arc<Context>) -> Self {
        let pool = StaticConstantPool::new();
        let class = ClassInfo::new(ClassCreateInfo {
            name: "Test".into(),
            super_class: Some(context.object_class()),
            flags: ClassFlags::PUBLIC,
            ..Default::default()
        });
        class.set_constant_pool(pool.clone());
        Self {
            context: context.clone(),
            class,
            pool,
        }
    }

    /// Subclass of `Test` sharing its pool.
    pub fn class(&self, name: &str, super_class: &ClassRef, fields: usize) -> ClassRef {
        let class = ClassInfo::new(ClassCreateInfo {
            name: name.into(),
            super_class: Some(super_class.clone()),
            flags: ClassFlags::PUBLIC,
            instance_fields: vec![crate::Kind::Int; fields],
            ..Default::default()
        });
        class.set_constant_pool(self.pool.clone());
        class
    }

    pub fn static_method(
        &self,
        name: &str,
        signature: &str,
        max_locals: usize,
        code: Vec<u8>,
    ) -> MethodRef {
        self.method(MethodCreateInfo {
            name: name.into(),
            signature: signature.into(),
            flags: MethodFlags::PUBLIC | MethodFlags::STATIC,
            code,
            max_locals,
            max_stack: 16,
            ..Default::default()
        })
    }

    pub fn method(&self, info: MethodCreateInfo) -> MethodRef {
        MethodInfo::new(&self.class, info).unwrap()
    }

    /// Pool index referring to `method`.
    pub fn method_ref(&self, method: &MethodRef) -> u16 {
        self.pool.add(PoolEntry::Method(method.clone()))
    }

    pub fn thread(&self) -> Thread {
        Thread::new(&self.context, &ThreadCreateInfo { stack_size: 1024 })
    }

    /// Invoke `method` on a fresh thread, expecting it to return.
    pub fn run(&self, method: &MethodRef, args: &[Value]) -> VmResult<Option<Value>> {
        let mut thread = self.thread();
        match thread.invoke(method, args)? {
            Completion::Returned(value) => Ok(value),
            Completion::Suspended => panic!("{method:?} suspended"),
        }
    }
}
