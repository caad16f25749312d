//! The shadow stack.
//!
//! When exit tracing swizzles return addresses, every traced thread mirrors
//! its call stack here so the exit dispatcher can recover the real return
//! address no matter how control left the frame. The stack grows down, so a
//! deeper frame always has a smaller frame pointer; any shadow entry whose
//! frame sits below the live stack belongs to a function that already
//! returned (usually via an exception) and is trimmed as an orphan.

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowStackEntry {
    /// Stack address of the entry frame at hook time.
    pub frame_ptr: u32,
    /// The caller's real return address, before swizzling.
    pub return_address: u32,
    /// The function that was entered.
    pub function: u32,
    /// RDTSC captured on entry; the exit side turns this into a duration.
    pub entry_cycles: u64,
}

#[derive(Debug, Default)]
pub struct ShadowStack {
    entries: Vec<ShadowStackEntry>,
    orphans_trimmed: u64,
    tail_calls_collapsed: u64,
}

impl ShadowStack {
    pub fn new() -> ShadowStack {
        ShadowStack::default()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn orphans_trimmed(&self) -> u64 {
        self.orphans_trimmed
    }

    pub fn tail_calls_collapsed(&self) -> u64 {
        self.tail_calls_collapsed
    }

    /// Records an entry. Shadow entries strictly below the new frame are
    /// orphans; an entry at exactly the same frame is a tail call and
    /// stays.
    pub fn push(&mut self, entry: ShadowStackEntry) {
        while self
            .entries
            .last()
            .is_some_and(|top| top.frame_ptr < entry.frame_ptr)
        {
            self.entries.pop();
            self.orphans_trimmed += 1;
        }
        trace!(
            "shadow push frame {:#x} ret {:#x}",
            entry.frame_ptr,
            entry.return_address
        );
        self.entries.push(entry);
    }

    /// Resolves an exit observed at `stack_ptr`: trims orphans, collapses
    /// any tail-call run sharing the exiting frame, and returns the most
    /// recent entry whose frame lies above the stack pointer.
    pub fn exit_at(&mut self, stack_ptr: u32) -> Option<ShadowStackEntry> {
        while self
            .entries
            .last()
            .is_some_and(|top| top.frame_ptr <= stack_ptr)
        {
            self.entries.pop();
            self.orphans_trimmed += 1;
        }
        let newest = self.entries.pop()?;
        while self
            .entries
            .last()
            .is_some_and(|e| e.frame_ptr == newest.frame_ptr)
        {
            self.entries.pop();
            self.tail_calls_collapsed += 1;
        }
        Some(newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(frame_ptr: u32, return_address: u32) -> ShadowStackEntry {
        ShadowStackEntry {
            frame_ptr,
            return_address,
            function: 0,
            entry_cycles: 0,
        }
    }

    #[test]
    fn plain_call_chain_unwinds_in_order() {
        let mut stack = ShadowStack::new();
        stack.push(entry(0x1000, 0xa));
        stack.push(entry(0x0f00, 0xb));
        stack.push(entry(0x0e00, 0xc));
        assert_eq!(stack.exit_at(0x0df0).unwrap().return_address, 0xc);
        assert_eq!(stack.exit_at(0x0ef0).unwrap().return_address, 0xb);
        assert_eq!(stack.exit_at(0x0ff0).unwrap().return_address, 0xa);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn exception_discarded_frames_are_trimmed_on_entry() {
        let mut stack = ShadowStack::new();
        stack.push(entry(0x1000, 0xa));
        stack.push(entry(0x0e00, 0xb));
        // An exception unwound past 0x0e00; the next call reuses that
        // region at a higher address.
        stack.push(entry(0x0f00, 0xc));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.exit_at(0x0ef0).unwrap().return_address, 0xc);
        assert_eq!(stack.exit_at(0x0ff0).unwrap().return_address, 0xa);
    }

    #[test]
    fn exception_discarded_frames_are_trimmed_on_exit() {
        let mut stack = ShadowStack::new();
        stack.push(entry(0x1000, 0xa));
        stack.push(entry(0x0f00, 0xb));
        stack.push(entry(0x0e00, 0xc));
        // Exit observed above both inner frames: they returned without
        // passing through their thunks.
        let got = stack.exit_at(0x0ff0).unwrap();
        assert_eq!(got.return_address, 0xa);
        assert_eq!(stack.orphans_trimmed(), 2);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn tail_call_run_collapses_to_the_most_recent() {
        let mut stack = ShadowStack::new();
        stack.push(entry(0x1000, 0xa));
        stack.push(entry(0x0f00, 0xb));
        // b tail-calls c and d at the same frame.
        stack.push(entry(0x0f00, 0xc));
        stack.push(entry(0x0f00, 0xd));
        let got = stack.exit_at(0x0e80).unwrap();
        assert_eq!(got.return_address, 0xd);
        assert_eq!(stack.tail_calls_collapsed(), 2);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn empty_stack_yields_nothing() {
        let mut stack = ShadowStack::new();
        assert!(stack.exit_at(0x1000).is_none());
    }
}
