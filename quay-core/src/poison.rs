//! RAII guard against half-written frames.
//!
//! When a write future is dropped mid-flight (timeout, task cancellation) the
//! broker may have received part of a command. The byte stream can no longer
//! be trusted, so the writer is marked poisoned and every later write fails
//! until the connection is torn down and re-established.
//!
//! ```rust
//! use quay_core::poison::PoisonGuard;
//!
//! struct Writer {
//!     poisoned: bool,
//! }
//!
//! impl Writer {
//!     async fn write(&mut self, _data: &[u8]) -> std::io::Result<()> {
//!         if self.poisoned {
//!             return Err(std::io::Error::new(
//!                 std::io::ErrorKind::BrokenPipe,
//!                 "writer poisoned by cancelled I/O",
//!             ));
//!         }
//!         let guard = PoisonGuard::new(&mut self.poisoned);
//!         // ... perform I/O ...
//!         guard.disarm();
//!         Ok(())
//!     }
//! }
//! ```

/// Marks a flag as poisoned unless disarmed before being dropped.
pub struct PoisonGuard<'a> {
    flag: &'a mut bool,
}

impl<'a> PoisonGuard<'a> {
    /// Arm the guard; the flag stays set unless `disarm()` is called.
    #[inline]
    pub fn new(flag: &'a mut bool) -> Self {
        *flag = true;
        Self { flag }
    }

    /// Mark the write as complete.
    ///
    /// Only call this once every byte of the logical write has been handed
    /// to the socket.
    #[inline]
    pub fn disarm(self) {
        *self.flag = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_on_drop() {
        let mut poisoned = false;
        {
            let _guard = PoisonGuard::new(&mut poisoned);
        }
        assert!(poisoned, "writer should be poisoned when guard is dropped");
    }

    #[test]
    fn test_disarm_clears_poison() {
        let mut poisoned = true;
        PoisonGuard::new(&mut poisoned).disarm();
        assert!(!poisoned);
    }

    #[compio::test]
    async fn test_cancelled_write_poisons() {
        let mut poisoned = false;
        let write = async {
            let guard = PoisonGuard::new(&mut poisoned);
            compio::time::sleep(std::time::Duration::from_secs(10)).await;
            guard.disarm();
        };
        let res = compio::time::timeout(std::time::Duration::from_millis(10), write).await;
        assert!(res.is_err());
        assert!(poisoned);
    }
}
