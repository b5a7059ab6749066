pub mod builder;
pub mod class_file;
pub mod code;
pub mod constant_pool;
pub mod decoder;
pub mod descriptor;
pub mod encoder;
pub mod frames;
pub mod hierarchy;
pub mod instruction;
pub mod opcodes;
pub mod result;
pub mod subroutine;

use crate::class_file::{ClassFile, MemberInfo};
use crate::code::{CodeAttribute, MethodBody};
use crate::frames::{CommonSuperclass, FrameContext};
use std::io::Read;

/// Class-file bytes start with this.
pub const CLASS_MAGIC: u32 = 0xCAFE_BABE;

/// Upper bound on the buffer reserved up front for an archive entry.
const ENTRY_PREALLOC_LIMIT: u64 = 1 << 20;

/// Reads an archive entry to the end.
///
/// `declared` is the size claimed by the archive header; it only sizes the initial buffer and is
/// capped, so a lying header cannot force a huge allocation.
pub fn read_entry(entry: &mut impl Read, declared: u64) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(declared.min(ENTRY_PREALLOC_LIMIT) as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Decodes a method's code into an editable, subroutine-free body.
///
/// # Arguments
/// * `class` - The owning class.
/// * `method` - One of `class.methods`.
///
/// # Returns
/// The index of the `Code` attribute within the method and the decoded body, or `None` for
/// methods without code.
pub fn read_method_body(
    class: &ClassFile,
    method: &MemberInfo,
) -> result::Result<Option<(usize, MethodBody)>> {
    let Some(index) = method.find_attribute(&class.constant_pool, "Code") else {
        return Ok(None);
    };
    let attr = CodeAttribute::parse(&method.attributes[index].info)?;
    let body = MethodBody::decode(&attr, &class.constant_pool)?;
    let body = if body.has_subroutines() {
        subroutine::inline_subroutines(&body)?
    } else {
        body
    };
    Ok(Some((index, body)))
}

/// Assembles `body` and stores it as the `Code` attribute at `code_index` of method
/// `method_index`.
///
/// Frames are recomputed for classes at version 50 and above. Older classes keep the body's
/// own `max_stack`.
pub fn write_method_body(
    class: &mut ClassFile,
    method_index: usize,
    code_index: usize,
    body: &MethodBody,
    resolver: &dyn CommonSuperclass,
) -> result::Result<()> {
    let class_name = class.name()?.to_string();
    let method = &class.methods[method_index];
    let access_flags = method.access_flags;
    let name = method.name(&class.constant_pool)?.to_string();
    let descriptor = method.descriptor(&class.constant_pool)?.to_string();
    let ctx = FrameContext {
        class_name: &class_name,
        access_flags,
        method_name: &name,
        descriptor: &descriptor,
        resolver,
    };
    let frames = (class.major_version >= class_file::V1_6).then_some(&ctx);
    let code = body.to_code_attribute(&mut class.constant_pool, frames)?;
    class.methods[method_index].attributes[code_index].info = code.to_bytes()?;
    Ok(())
}
