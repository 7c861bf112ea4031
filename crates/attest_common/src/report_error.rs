use std::io;

/// User-facing error reporting for every stage of the pipeline. The encoder
/// never prints directly; everything funnels through this at the CLI boundary.
pub trait Reportable {
    fn report(&self, dest: &mut impl io::Write) -> io::Result<()>;
    fn exit_status(&self) -> i32;
}
