/// Trait providing functions for working with stopped threads.
///
/// In a kernel debugging session, threads and processes are identified by
/// the address of their kernel object (`$thread` and `$proc`).
pub trait Thread {
    /// Returns the thread's ID.
    fn id(&self) -> u64;

    /// Returns the ID of the process owning the thread.
    fn process_id(&self) -> u64;

    /// Returns the thread's instruction address.
    fn instr_addr(&self) -> u64;
}
