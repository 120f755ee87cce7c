use std::process::ExitCode;

mod afl;

pub fn main() -> ExitCode {
    rlpuffin::cli::main(afl::load_config)
}
