//! Module for the `decode` subcommand, which prints a class file's header and the decoded
//! bytecode of every method.

use async_trait::async_trait;
use clap::Args;
use mtrace_core::class_file::ClassFile;
use mtrace_core::code::{CodeAttribute, MethodBody};
use mtrace_core::instruction::decode_instructions;
use mtrace_transform::collector::{Triviality, triviality};
use std::error::Error;
use std::fs;
use std::path::PathBuf;

/// Arguments for the `decode` subcommand.
#[derive(Args)]
pub struct DecodeArgs {
    /// Path to a .class file.
    pub class_file: PathBuf,
    /// Only print methods with this name.
    #[arg(long)]
    pub method: Option<String>,
}

/// Executes the `decode` subcommand.
#[async_trait]
impl super::Command for DecodeArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let bytes = fs::read(&self.class_file)?;
        let class = ClassFile::parse(&bytes)?;
        let pool = &class.constant_pool;
        println!(
            "class {} extends {} (version {}.{}, access 0x{:04x})",
            class.name()?,
            class.super_name()?.unwrap_or("-"),
            class.major_version,
            class.minor_version,
            class.access_flags
        );
        for interface in class.interface_names()? {
            println!("  implements {interface}");
        }

        for method in &class.methods {
            let name = method.name(pool)?;
            if self.method.as_deref().is_some_and(|m| m != name) {
                continue;
            }
            println!();
            println!(
                "{}{} (access 0x{:04x})",
                name,
                method.descriptor(pool)?,
                method.access_flags
            );
            let Some(index) = method.find_attribute(pool, "Code") else {
                println!("  <no code>, {}", describe(triviality(name, None)));
                continue;
            };
            let code = CodeAttribute::parse(&method.attributes[index].info)?;
            let body = MethodBody::decode(&code, pool)?;
            println!(
                "  max_stack={} max_locals={} length={}, {}",
                code.max_stack,
                code.max_locals,
                code.code.len(),
                describe(triviality(name, Some(&body)))
            );
            for instruction in decode_instructions(&code.code)? {
                println!("  {instruction}");
            }
            for entry in &code.exception_table {
                let catch = if entry.catch_type == 0 {
                    "any"
                } else {
                    pool.class_name(entry.catch_type)?
                };
                println!(
                    "  try [{}, {}) -> {} catch {}",
                    entry.start_pc, entry.end_pc, entry.handler_pc, catch
                );
            }
            for attr in &code.attributes {
                println!("  attribute {} ({} bytes)", attr.name(pool)?, attr.info.len());
            }
        }
        Ok(())
    }
}

fn describe(kind: Option<Triviality>) -> &'static str {
    match kind {
        Some(Triviality::Empty) => "trivial (empty)",
        Some(Triviality::Accessor) => "trivial (accessor)",
        Some(Triviality::Leaf) => "trivial (leaf)",
        None => "traceable",
    }
}
