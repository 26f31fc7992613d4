//! CLI configuration surface, grounded on the teacher's
//! `runtime::options::Options` (same `structopt` derive, same
//! parse-a-human-size helper pattern).

use structopt::StructOpt;

fn parse_size(s: &str) -> Result<usize, std::num::ParseIntError> {
    let s = s.to_lowercase();
    let split_at = s.find(|c: char| !c.is_digit(10)).unwrap_or(s.len());
    let (number, unit) = s.split_at(split_at);
    let multiplier = match unit {
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        _ => 1,
    };
    number.parse::<usize>().map(|n| n * multiplier)
}

/// CLI surface, per spec §6: one positional path argument, non-zero exit on
/// core error. `--trace` and the two capacity overrides are ambient
/// additions (SPEC_FULL §1.1) that do not change bytecode semantics.
#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "clearvm", about = "ClearVM bytecode virtual machine")]
pub struct Options {
    /// Path to a compiled ClearVM bytecode file.
    #[structopt(parse(from_os_str))]
    pub path: std::path::PathBuf,

    /// Enable opcode-level trace logging (equivalent to RUST_LOG=trace).
    #[structopt(long = "trace")]
    pub trace: bool,

    /// Override the value stack's depth bound for experimentation.
    #[structopt(long = "stack-size", parse(try_from_str = parse_size))]
    pub stack_size: Option<usize>,

    /// Override the string intern table's initial bucket count.
    #[structopt(long = "string-table-capacity", parse(try_from_str = parse_size))]
    pub string_table_capacity: Option<usize>,
}

impl Options {
    pub fn limits(&self) -> crate::vm::Limits {
        let default = crate::vm::Limits::default();
        crate::vm::Limits {
            stack_max: self.stack_size.unwrap_or(default.stack_max),
            string_table_initial_capacity: self
                .string_table_capacity
                .unwrap_or(default.string_table_initial_capacity),
        }
    }
}
