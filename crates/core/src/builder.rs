//! Programmatic class construction.
//!
//! [`ClassBuilder`] assembles small classes from scratch, and [`add_method`] appends a method
//! with a label-based body to any [`ClassFile`], computing frames when the class version
//! requires them.

use crate::class_file::{ACC_PUBLIC, ACC_SUPER, Attribute, ClassFile, MemberInfo, V1_6};
use crate::code::{Label, MethodBody, Node, TryCatch};
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor;
use crate::frames::{CommonSuperclass, FrameContext};
use crate::hierarchy::{BootstrapTypes, SuperclassResolver, common_super_class};
use crate::instruction::{Insn, push_int};
use crate::opcodes::INVOKEINTERFACE;
use crate::result::Result;

/// Appends a method to `class`.
///
/// # Arguments
/// * `class` - The class to extend.
/// * `access` - Method access flags.
/// * `name` - Method name.
/// * `descriptor` - Method descriptor.
/// * `body` - The code, or `None` for abstract and native methods.
/// * `resolver` - Used for frame computation when the class version is at least 50.
pub fn add_method(
    class: &mut ClassFile,
    access: u16,
    name: &str,
    descriptor: &str,
    body: Option<&MethodBody>,
    resolver: &dyn CommonSuperclass,
) -> Result<()> {
    let class_name = class.name()?.to_string();
    let pool = &mut class.constant_pool;
    let name_index = pool.add_utf8(name)?;
    let descriptor_index = pool.add_utf8(descriptor)?;
    let mut attributes = Vec::new();
    if let Some(body) = body {
        let ctx = FrameContext {
            class_name: &class_name,
            access_flags: access,
            method_name: name,
            descriptor,
            resolver,
        };
        let frames = (class.major_version >= V1_6).then_some(&ctx);
        let code = body.to_code_attribute(pool, frames)?;
        attributes.push(Attribute {
            name_index: pool.add_utf8("Code")?,
            info: code.to_bytes()?,
        });
    }
    class.methods.push(MemberInfo {
        access_flags: access,
        name_index,
        descriptor_index,
        attributes,
    });
    Ok(())
}

/// Builds a class from scratch.
///
/// ```ignore
/// let mut b = ClassBuilder::new("app/Foo", "java/lang/Object")?;
/// b.method(ACC_PUBLIC, "bar", "()V", |c| {
///     c.op(RETURN);
///     Ok(())
/// })?;
/// let bytes = b.to_bytes()?;
/// ```
pub struct ClassBuilder {
    class: ClassFile,
    resolver: Box<dyn CommonSuperclass>,
}

impl ClassBuilder {
    /// Starts a public class with version 52 and no members.
    pub fn new(name: &str, super_name: &str) -> Result<Self> {
        let mut pool = ConstantPool::default();
        let this_class = pool.add_class(name)?;
        let super_class = pool.add_class(super_name)?;
        let resolver = SuperclassResolver::new().with_strategy(
            "bootstrap",
            Box::new(|a: &str, b: &str| common_super_class(&BootstrapTypes, a, b)),
        );
        Ok(Self {
            class: ClassFile {
                minor_version: 0,
                major_version: 52,
                constant_pool: pool,
                access_flags: ACC_PUBLIC | ACC_SUPER,
                this_class,
                super_class,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                attributes: Vec::new(),
            },
            resolver: Box::new(resolver),
        })
    }

    pub fn version(&mut self, major: u16) -> &mut Self {
        self.class.major_version = major;
        self
    }

    pub fn access(&mut self, flags: u16) -> &mut Self {
        self.class.access_flags = flags;
        self
    }

    pub fn resolver(&mut self, resolver: Box<dyn CommonSuperclass>) -> &mut Self {
        self.resolver = resolver;
        self
    }

    pub fn interface(&mut self, name: &str) -> Result<&mut Self> {
        let index = self.class.constant_pool.add_class(name)?;
        self.class.interfaces.push(index);
        Ok(self)
    }

    pub fn field(&mut self, access: u16, name: &str, descriptor: &str) -> Result<&mut Self> {
        let pool = &mut self.class.constant_pool;
        let name_index = pool.add_utf8(name)?;
        let descriptor_index = pool.add_utf8(descriptor)?;
        self.class.fields.push(MemberInfo {
            access_flags: access,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        Ok(self)
    }

    /// Adds a method whose body is written by `write`.
    pub fn method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        write: impl FnOnce(&mut CodeWriter<'_>) -> Result<()>,
    ) -> Result<&mut Self> {
        let mut writer = CodeWriter {
            pool: &mut self.class.constant_pool,
            body: MethodBody::new(0, 0),
        };
        write(&mut writer)?;
        let body = writer.body;
        add_method(
            &mut self.class,
            access,
            name,
            descriptor,
            Some(&body),
            self.resolver.as_ref(),
        )?;
        Ok(self)
    }

    /// Adds a method without code.
    pub fn bodiless_method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<&mut Self> {
        add_method(
            &mut self.class,
            access,
            name,
            descriptor,
            None,
            self.resolver.as_ref(),
        )?;
        Ok(self)
    }

    pub fn build(self) -> ClassFile {
        self.class
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.class.to_bytes()
    }
}

/// Writes one method body, interning constants as it goes.
pub struct CodeWriter<'a> {
    pool: &'a mut ConstantPool,
    body: MethodBody,
}

impl CodeWriter<'_> {
    pub fn maxs(&mut self, max_stack: u16, max_locals: u16) -> &mut Self {
        self.body.max_stack = max_stack;
        self.body.max_locals = max_locals;
        self
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.body.push(Insn::Simple(opcode));
        self
    }

    pub fn insn(&mut self, insn: Insn<Label>) -> &mut Self {
        self.body.push(insn);
        self
    }

    /// Pushes an `int`, falling back to `ldc` of an `Integer` constant.
    pub fn int(&mut self, value: i32) -> Result<&mut Self> {
        let insn = match push_int(value) {
            Some(insn) => insn,
            None => Insn::Ldc {
                index: self.pool.add_integer(value)?,
            },
        };
        self.body.push(insn);
        Ok(self)
    }

    pub fn string(&mut self, value: &str) -> Result<&mut Self> {
        let string_index = self.pool.add_utf8(value)?;
        let index = self.pool.add(Constant::String { string_index })?;
        self.body.push(Insn::Ldc { index });
        Ok(self)
    }

    pub fn var(&mut self, opcode: u8, index: u16) -> &mut Self {
        self.body.push(Insn::Var { opcode, index });
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.body.new_label()
    }

    pub fn place(&mut self, label: Label) -> &mut Self {
        self.body.place(label);
        self
    }

    pub fn line(&mut self, line: u16) -> &mut Self {
        self.body.nodes.push(Node::Line(line));
        self
    }

    pub fn jump(&mut self, opcode: u8, target: Label) -> &mut Self {
        self.body.push(Insn::Jump { opcode, target });
        self
    }

    /// `getfield`, `putfield`, `getstatic` or `putstatic`.
    pub fn field(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Result<&mut Self> {
        let index = self.pool.add_field_ref(owner, name, descriptor)?;
        self.body.push(Insn::Constant { opcode, index });
        Ok(self)
    }

    /// `invokevirtual`, `invokespecial`, `invokestatic` or `invokeinterface`.
    pub fn invoke(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Result<&mut Self> {
        if opcode == INVOKEINTERFACE {
            let class_index = self.pool.add_class(owner)?;
            let name_and_type_index = self.pool.add_name_and_type(name, descriptor)?;
            let index = self.pool.add(Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            })?;
            let args = descriptor::argument_slots(&descriptor::parse_method(descriptor)?);
            self.body.push(Insn::InvokeInterface {
                index,
                count: (args + 1) as u8,
            });
        } else {
            let index = self.pool.add_method_ref(owner, name, descriptor)?;
            self.body.push(Insn::Constant { opcode, index });
        }
        Ok(self)
    }

    /// `new`, `anewarray`, `checkcast` or `instanceof`.
    pub fn type_insn(&mut self, opcode: u8, class: &str) -> Result<&mut Self> {
        let index = self.pool.add_class(class)?;
        self.body.push(Insn::Constant { opcode, index });
        Ok(self)
    }

    pub fn try_catch(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> Result<&mut Self> {
        let catch_type = match catch_type {
            Some(name) => self.pool.add_class(name)?,
            None => 0,
        };
        self.body.try_catches.push(TryCatch {
            start,
            end,
            handler,
            catch_type,
        });
        Ok(self)
    }

    /// Direct access for shapes the helpers do not cover.
    pub fn body_mut(&mut self) -> &mut MethodBody {
        &mut self.body
    }
}
