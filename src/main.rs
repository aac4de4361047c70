use std::process::ExitCode;

fn main() -> ExitCode {
    cachebench::cmdline()
}
