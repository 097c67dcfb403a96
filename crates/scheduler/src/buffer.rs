//! Command buffers handed to the scheduler by the buffer manager.

use std::fmt;

/// Packet memory owned by the buffer manager.
///
/// The scheduler reads the packet on submission and writes state, CU index
/// and timestamps back into it. The words must stay valid until
/// [`ExecBuffer::release`] is called, which happens exactly once per
/// submission: after completion, after an error, or at teardown.
pub trait ExecBuffer: Send {
    fn words(&self) -> &[u32];

    fn words_mut(&mut self) -> &mut [u32];

    fn release(self: Box<Self>) {}
}

type ReleaseFn = Box<dyn FnOnce(Vec<u32>) + Send>;

/// Heap-backed buffer with an optional release callback receiving the final
/// packet contents.
pub struct HostBuffer {
    words: Vec<u32>,
    on_release: Option<ReleaseFn>,
}

impl HostBuffer {
    pub fn new(words: Vec<u32>) -> Self {
        Self {
            words,
            on_release: None,
        }
    }

    pub fn on_release(mut self, f: impl FnOnce(Vec<u32>) + Send + 'static) -> Self {
        self.on_release = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("words", &self.words.len())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

impl ExecBuffer for HostBuffer {
    fn words(&self) -> &[u32] {
        &self.words
    }

    fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    fn release(self: Box<Self>) {
        let HostBuffer { words, on_release } = *self;
        if let Some(f) = on_release {
            f(words);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_release_hands_back_words() {
        let (tx, rx) = mpsc::channel();
        let mut buffer: Box<dyn ExecBuffer> = Box::new(HostBuffer::new(vec![1, 2]).on_release(move |w| {
            tx.send(w).unwrap();
        }));
        buffer.words_mut()[1] = 5;
        buffer.release();
        assert_eq!(rx.recv().unwrap(), vec![1, 5]);
    }
}
