use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Condvar, Mutex, RawMutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelDescriptor {
    pub name: &'static str,
    /// Each thread may drive its own instance concurrently.
    pub thread_safe: bool,
    /// May run while the driving thread is inside the decoder API.
    pub async_safe: bool,
}

impl AccelDescriptor {
    pub const fn new(name: &'static str, thread_safe: bool, async_safe: bool) -> Self {
        Self {
            name,
            thread_safe,
            async_safe,
        }
    }
}

/// Accelerator state owned by the decoder. Thread-safe accelerators get one
/// fork per worker; the others share a single instance behind the
/// serialization lock.
#[derive(Debug, Clone)]
pub struct AccelState {
    pub descriptor: AccelDescriptor,
    pub frames_decoded: u64,
    pub forks: u32,
}

impl AccelState {
    pub fn new(descriptor: AccelDescriptor) -> Self {
        Self {
            descriptor,
            frames_decoded: 0,
            forks: 0,
        }
    }

    pub fn fork(&self) -> Self {
        let mut copy = self.clone();
        copy.forks += 1;
        copy
    }
}

/// How a codec context reaches its accelerator.
#[derive(Default)]
pub(crate) enum AccelBinding {
    #[default]
    None,
    Private(AccelState),
    Shared {
        descriptor: AccelDescriptor,
        state: Arc<Mutex<AccelState>>,
        guard: Option<ArcMutexGuard<RawMutex, AccelState>>,
    },
}

impl AccelBinding {
    pub fn shared(state: &Arc<Mutex<AccelState>>) -> Self {
        let descriptor = state.lock().descriptor.clone();
        AccelBinding::Shared {
            descriptor,
            state: Arc::clone(state),
            guard: None,
        }
    }

    pub fn descriptor(&self) -> Option<&AccelDescriptor> {
        match self {
            AccelBinding::None => None,
            AccelBinding::Private(state) => Some(&state.descriptor),
            AccelBinding::Shared { descriptor, .. } => Some(descriptor),
        }
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, AccelBinding::Shared { .. })
    }

    pub fn is_async_safe(&self) -> bool {
        self.descriptor().is_none_or(|d| d.async_safe)
    }

    pub fn is_held(&self) -> bool {
        matches!(self, AccelBinding::Shared { guard: Some(_), .. })
    }

    /// Takes the serialization lock. No-op when not shared or already held.
    pub fn acquire(&mut self) {
        if let AccelBinding::Shared { state, guard, .. } = self {
            if guard.is_none() {
                *guard = Some(state.lock_arc());
            }
        }
    }

    pub fn release(&mut self) {
        if let AccelBinding::Shared { guard, .. } = self {
            *guard = None;
        }
    }

    pub fn state_mut(&mut self) -> Option<&mut AccelState> {
        match self {
            AccelBinding::None => None,
            AccelBinding::Private(state) => Some(state),
            AccelBinding::Shared { guard, .. } => guard.as_deref_mut(),
        }
    }

    /// State a later thread should start from, for thread-safe accelerators.
    pub fn forward(&self) -> Option<AccelState> {
        match self {
            AccelBinding::Private(state) => Some(state.fork()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for AccelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccelBinding::None => write!(f, "None"),
            AccelBinding::Private(state) => f.debug_tuple("Private").field(state).finish(),
            AccelBinding::Shared {
                descriptor, guard, ..
            } => f
                .debug_struct("Shared")
                .field("descriptor", descriptor)
                .field("held", &guard.is_some())
                .finish(),
        }
    }
}

/// A lock that is taken and released by different call sites rather than
/// scoped to a guard: the driving thread holds it between decoder calls and
/// lets workers with async-unsafe accelerators take it while it waits.
pub(crate) struct AsyncLock {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl AsyncLock {
    pub fn new(locked: bool) -> Self {
        Self {
            locked: Mutex::new(locked),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cond.wait(&mut locked);
        }
        *locked = true;
    }

    pub fn unlock(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.cond.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}
