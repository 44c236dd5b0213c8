//! Runtime class descriptors
//!
//! A `Class` is the runtime's description of a type: its kind, superclass,
//! interfaces, modifiers and declared members. Class identity is the
//! identity of the shared `Arc<Class>`; two descriptors with the same name
//! are different classes.
//!
//! Member signatures refer to classes weakly so that classes referring to
//! each other (or to themselves) do not keep each other alive.

mod reflector;
mod standard;

pub use reflector::{DescriptorReflector, Reflector};
pub use standard::StandardClasses;

use crate::reference::{DropSignal, Referent};
use once_cell::sync::OnceCell;
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Weak};

/// Errors raised while reflecting on a class
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReflectError {
    /// The class refuses reflective access to its members
    #[error("Class {0} is not accessible")]
    Inaccessible(Arc<str>),

    /// A method signature refers to a class that is no longer loaded
    #[error("Method {0} refers to a class that is no longer loaded")]
    Unresolved(Arc<str>),
}

/// What kind of type a `Class` describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    /// Ordinary (possibly abstract) class
    Class,
    /// Interface
    Interface,
    /// Primitive value type, including `void`
    Primitive,
    /// Array of a component type
    Array,
}

/// Access and property flags of classes and methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Modifiers(u32);

impl Modifiers {
    /// No flags
    pub const NONE: Modifiers = Modifiers(0);
    /// Accessible from anywhere
    pub const PUBLIC: Modifiers = Modifiers(0x0001);
    /// Accessible only within the declaring class
    pub const PRIVATE: Modifiers = Modifiers(0x0002);
    /// Accessible from subclasses
    pub const PROTECTED: Modifiers = Modifiers(0x0004);
    /// Belongs to the class rather than an instance
    pub const STATIC: Modifiers = Modifiers(0x0008);
    /// Cannot be overridden or subclassed
    pub const FINAL: Modifiers = Modifiers(0x0010);
    /// Runs under the receiver's monitor
    pub const SYNCHRONIZED: Modifiers = Modifiers(0x0020);
    /// Implemented outside the runtime
    pub const NATIVE: Modifiers = Modifiers(0x0100);
    /// Declared as an interface
    pub const INTERFACE: Modifiers = Modifiers(0x0200);
    /// Has no implementation
    pub const ABSTRACT: Modifiers = Modifiers(0x0400);
    /// Generated by the compiler, not present in source
    pub const SYNTHETIC: Modifiers = Modifiers(0x1000);

    /// Create from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Modifiers(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if every flag in `other` is set
    pub const fn contains(self, other: Modifiers) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check the public flag
    pub const fn is_public(self) -> bool {
        self.contains(Self::PUBLIC)
    }

    /// Check the static flag
    pub const fn is_static(self) -> bool {
        self.contains(Self::STATIC)
    }

    /// Check the abstract flag
    pub const fn is_abstract(self) -> bool {
        self.contains(Self::ABSTRACT)
    }

    /// Check the synthetic flag
    pub const fn is_synthetic(self) -> bool {
        self.contains(Self::SYNTHETIC)
    }
}

impl BitOr for Modifiers {
    type Output = Modifiers;

    fn bitor(self, rhs: Modifiers) -> Modifiers {
        Modifiers(self.0 | rhs.0)
    }
}

/// A type used in a method definition
#[derive(Clone)]
pub enum TypeRef {
    /// The class being defined
    This,
    /// An already defined class
    Class(Arc<Class>),
}

impl TypeRef {
    fn resolve(&self, this: &Weak<Class>) -> Weak<Class> {
        match self {
            TypeRef::This => this.clone(),
            TypeRef::Class(class) => Arc::downgrade(class),
        }
    }
}

impl From<&Arc<Class>> for TypeRef {
    fn from(class: &Arc<Class>) -> Self {
        TypeRef::Class(class.clone())
    }
}

/// Definition of a method, before its class exists
#[derive(Clone)]
pub struct MethodDef {
    name: Arc<str>,
    parameters: Vec<TypeRef>,
    return_type: TypeRef,
    modifiers: Modifiers,
}

impl MethodDef {
    /// A public method
    pub fn new(name: &str, parameters: Vec<TypeRef>, return_type: TypeRef) -> Self {
        Self {
            name: Arc::from(name),
            parameters,
            return_type,
            modifiers: Modifiers::PUBLIC,
        }
    }

    /// Replace the modifiers
    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    fn resolve(&self, declaring: &Weak<Class>) -> Method {
        Method {
            name: self.name.clone(),
            parameter_types: self.parameters.iter().map(|p| p.resolve(declaring)).collect(),
            return_type: self.return_type.resolve(declaring),
            modifiers: self.modifiers,
            declaring_class: declaring.clone(),
        }
    }
}

/// A method declared by a class
#[derive(Clone)]
pub struct Method {
    name: Arc<str>,
    parameter_types: Box<[Weak<Class>]>,
    return_type: Weak<Class>,
    modifiers: Modifiers,
    declaring_class: Weak<Class>,
}

impl Method {
    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared method name
    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// Method modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// Check the parameter list against `types` by class identity
    pub fn has_parameter_types(&self, types: &[Arc<Class>]) -> bool {
        self.parameter_types.len() == types.len()
            && self
                .parameter_types
                .iter()
                .zip(types)
                .all(|(p, t)| std::ptr::eq(p.as_ptr(), Arc::as_ptr(t)))
    }

    /// Number of declared parameters
    pub fn arity(&self) -> usize {
        self.parameter_types.len()
    }

    /// Parameter types, failing if one of them has been unloaded
    pub fn parameter_types(&self) -> Result<Vec<Arc<Class>>, ReflectError> {
        self.parameter_types
            .iter()
            .map(|p| self.upgrade(p))
            .collect()
    }

    /// Return type, failing if it has been unloaded
    pub fn return_type(&self) -> Result<Arc<Class>, ReflectError> {
        self.upgrade(&self.return_type)
    }

    /// The class declaring this method, if still loaded
    pub fn declaring_class(&self) -> Option<Arc<Class>> {
        self.declaring_class.upgrade()
    }

    fn upgrade(&self, class: &Weak<Class>) -> Result<Arc<Class>, ReflectError> {
        class
            .upgrade()
            .ok_or_else(|| ReflectError::Unresolved(self.name.clone()))
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("arity", &self.arity())
            .field("modifiers", &self.modifiers)
            .finish()
    }
}

/// Definition of a field, before its class exists
#[derive(Clone)]
pub struct FieldDef {
    name: Arc<str>,
    field_type: TypeRef,
    modifiers: Modifiers,
}

impl FieldDef {
    /// A public instance field
    pub fn new(name: &str, field_type: TypeRef) -> Self {
        Self {
            name: Arc::from(name),
            field_type,
            modifiers: Modifiers::PUBLIC,
        }
    }

    /// Replace the modifiers
    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    fn resolve(&self, declaring: &Weak<Class>) -> Field {
        Field {
            name: self.name.clone(),
            field_type: self.field_type.resolve(declaring),
            modifiers: self.modifiers,
            declaring_class: declaring.clone(),
        }
    }
}

/// A field declared by a class
#[derive(Clone)]
pub struct Field {
    name: Arc<str>,
    field_type: Weak<Class>,
    modifiers: Modifiers,
    declaring_class: Weak<Class>,
}

impl Field {
    /// Field name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// Declared type, failing if it has been unloaded
    pub fn field_type(&self) -> Result<Arc<Class>, ReflectError> {
        self.field_type
            .upgrade()
            .ok_or_else(|| ReflectError::Unresolved(self.name.clone()))
    }

    /// The class declaring this field, if still loaded
    pub fn declaring_class(&self) -> Option<Arc<Class>> {
        self.declaring_class.upgrade()
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("modifiers", &self.modifiers)
            .finish()
    }
}

/// Definition of a constructor, before its class exists
#[derive(Clone)]
pub struct ConstructorDef {
    parameters: Vec<TypeRef>,
    modifiers: Modifiers,
}

impl ConstructorDef {
    /// A public constructor
    pub fn new(parameters: Vec<TypeRef>) -> Self {
        Self {
            parameters,
            modifiers: Modifiers::PUBLIC,
        }
    }

    /// Replace the modifiers
    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    fn resolve(&self, declaring: &Weak<Class>) -> Constructor {
        Constructor {
            parameter_types: self.parameters.iter().map(|p| p.resolve(declaring)).collect(),
            modifiers: self.modifiers,
            declaring_class: declaring.clone(),
        }
    }
}

/// A constructor declared by a class
#[derive(Clone)]
pub struct Constructor {
    parameter_types: Box<[Weak<Class>]>,
    modifiers: Modifiers,
    declaring_class: Weak<Class>,
}

impl Constructor {
    /// Constructor modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// Number of declared parameters
    pub fn arity(&self) -> usize {
        self.parameter_types.len()
    }

    /// Check the parameter list against `types` by class identity
    pub fn has_parameter_types(&self, types: &[Arc<Class>]) -> bool {
        self.parameter_types.len() == types.len()
            && self
                .parameter_types
                .iter()
                .zip(types)
                .all(|(p, t)| std::ptr::eq(p.as_ptr(), Arc::as_ptr(t)))
    }

    /// Parameter types, failing if one of them has been unloaded
    pub fn parameter_types(&self) -> Result<Vec<Arc<Class>>, ReflectError> {
        self.parameter_types
            .iter()
            .map(|p| {
                p.upgrade().ok_or_else(|| {
                    let owner = self
                        .declaring_class
                        .upgrade()
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| Arc::from("<init>"));
                    ReflectError::Unresolved(owner)
                })
            })
            .collect()
    }

    /// The class declaring this constructor, if still loaded
    pub fn declaring_class(&self) -> Option<Arc<Class>> {
        self.declaring_class.upgrade()
    }
}

impl fmt::Debug for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constructor")
            .field("arity", &self.arity())
            .field("modifiers", &self.modifiers)
            .finish()
    }
}

/// Runtime descriptor of a type
pub struct Class {
    name: Arc<str>,
    kind: ClassKind,
    superclass: Option<Arc<Class>>,
    interfaces: Box<[Arc<Class>]>,
    component: Option<Arc<Class>>,
    modifiers: Modifiers,
    methods: OnceCell<Box<[Method]>>,
    fields: Box<[Field]>,
    constructors: Box<[Constructor]>,
    accessible: bool,
    signal: DropSignal,
}

impl Class {
    /// Fully qualified name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared name
    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// Kind of type
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Check if this is a primitive type (including `void`)
    pub fn is_primitive(&self) -> bool {
        self.kind == ClassKind::Primitive
    }

    /// Check if this is an interface
    pub fn is_interface(&self) -> bool {
        self.kind == ClassKind::Interface
    }

    /// Check if this is an array type
    pub fn is_array(&self) -> bool {
        self.kind == ClassKind::Array
    }

    /// Check if this is the root of the class hierarchy
    pub fn is_root(&self) -> bool {
        self.kind == ClassKind::Class && self.superclass.is_none()
    }

    /// Direct superclass (`None` for the root, interfaces and primitives)
    pub fn superclass(&self) -> Option<&Arc<Class>> {
        self.superclass.as_ref()
    }

    /// Directly implemented (or extended, for interfaces) interfaces
    pub fn interfaces(&self) -> &[Arc<Class>] {
        &self.interfaces
    }

    /// Component type of an array
    pub fn component_type(&self) -> Option<&Arc<Class>> {
        self.component.as_ref()
    }

    /// Class modifiers
    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// Check if reflective access to members is allowed
    pub fn is_accessible(&self) -> bool {
        self.accessible
    }

    /// Declared methods, in declaration order
    pub fn declared_methods(&self) -> &[Method] {
        self.methods.get().map(|m| &m[..]).unwrap_or(&[])
    }

    /// Declared fields, in declaration order
    pub fn declared_fields(&self) -> &[Field] {
        &self.fields
    }

    /// Declared constructors, in declaration order
    pub fn declared_constructors(&self) -> &[Constructor] {
        &self.constructors
    }

    /// Define the methods of a class built without any
    ///
    /// Returns false if the class already has methods.
    pub fn define_methods(self: &Arc<Self>, methods: Vec<MethodDef>) -> bool {
        let me = Arc::downgrade(self);
        let resolved: Box<[Method]> = methods.iter().map(|m| m.resolve(&me)).collect();
        self.methods.set(resolved).is_ok()
    }

    /// Check if a value of class `other` can be stored in a variable of this class
    ///
    /// Primitives are assignable only from themselves; the root accepts every
    /// reference type; arrays are covariant in their component type.
    pub fn is_assignable_from(&self, other: &Class) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match (self.kind, other.kind) {
            (ClassKind::Primitive, _) | (_, ClassKind::Primitive) => false,
            _ if self.is_root() => true,
            (ClassKind::Array, ClassKind::Array) => match (&self.component, &other.component) {
                (Some(target), Some(source)) => target.is_assignable_from(source),
                _ => false,
            },
            (ClassKind::Array, _) => false,
            _ => other.inherits_from(self),
        }
    }

    fn inherits_from(&self, target: &Class) -> bool {
        self.superclass
            .iter()
            .chain(self.interfaces.iter())
            .any(|c| std::ptr::eq(c.as_ref(), target) || c.inherits_from(target))
    }
}

impl Referent for Class {
    fn drop_signal(&self) -> &DropSignal {
        &self.signal
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Builder for `Class` descriptors
pub struct ClassBuilder {
    name: Arc<str>,
    kind: ClassKind,
    superclass: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
    component: Option<Arc<Class>>,
    modifiers: Modifiers,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
    constructors: Vec<ConstructorDef>,
    accessible: bool,
}

impl ClassBuilder {
    fn new(name: &str, kind: ClassKind, modifiers: Modifiers) -> Self {
        Self {
            name: Arc::from(name),
            kind,
            superclass: None,
            interfaces: Vec::new(),
            component: None,
            modifiers,
            methods: Vec::new(),
            fields: Vec::new(),
            constructors: Vec::new(),
            accessible: true,
        }
    }

    /// A public class (the root unless `extends` is called)
    pub fn class(name: &str) -> Self {
        Self::new(name, ClassKind::Class, Modifiers::PUBLIC)
    }

    /// A public interface
    pub fn interface(name: &str) -> Self {
        Self::new(
            name,
            ClassKind::Interface,
            Modifiers::PUBLIC | Modifiers::INTERFACE | Modifiers::ABSTRACT,
        )
    }

    /// A primitive type
    pub fn primitive(name: &str) -> Self {
        Self::new(
            name,
            ClassKind::Primitive,
            Modifiers::PUBLIC | Modifiers::FINAL | Modifiers::ABSTRACT,
        )
    }

    /// An array of `component`, whose superclass is `root`
    pub fn array(component: &Arc<Class>, root: &Arc<Class>) -> Self {
        let mut builder = Self::new(
            &format!("{}[]", component.name),
            ClassKind::Array,
            Modifiers::PUBLIC | Modifiers::FINAL | Modifiers::ABSTRACT,
        );
        builder.superclass = Some(root.clone());
        builder.component = Some(component.clone());
        builder
    }

    /// Set the superclass
    pub fn extends(mut self, superclass: &Arc<Class>) -> Self {
        self.superclass = Some(superclass.clone());
        self
    }

    /// Add an implemented interface
    pub fn implements(mut self, interface: &Arc<Class>) -> Self {
        self.interfaces.push(interface.clone());
        self
    }

    /// Replace the modifiers
    pub fn modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Declare a method
    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Declare a field
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Declare a constructor
    pub fn constructor(mut self, constructor: ConstructorDef) -> Self {
        self.constructors.push(constructor);
        self
    }

    /// Deny reflective access to members
    pub fn inaccessible(mut self) -> Self {
        self.accessible = false;
        self
    }

    /// Build the class
    pub fn build(self) -> Arc<Class> {
        Arc::new_cyclic(|me| {
            let methods = OnceCell::new();
            if !self.methods.is_empty() {
                let resolved: Box<[Method]> = self.methods.iter().map(|m| m.resolve(me)).collect();
                let _ = methods.set(resolved);
            }
            Class {
                name: self.name,
                kind: self.kind,
                superclass: self.superclass,
                interfaces: self.interfaces.into_boxed_slice(),
                component: self.component,
                modifiers: self.modifiers,
                methods,
                fields: self.fields.iter().map(|f| f.resolve(me)).collect(),
                constructors: self.constructors.iter().map(|c| c.resolve(me)).collect(),
                accessible: self.accessible,
                signal: DropSignal::new(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> (Arc<Class>, Arc<Class>, Arc<Class>, Arc<Class>) {
        let object = ClassBuilder::class("Object").build();
        let shape = ClassBuilder::interface("Shape").build();
        let base = ClassBuilder::class("Base").extends(&object).implements(&shape).build();
        let derived = ClassBuilder::class("Derived").extends(&base).build();
        (object, shape, base, derived)
    }

    #[test]
    fn test_modifiers() {
        let m = Modifiers::PUBLIC | Modifiers::STATIC;
        assert!(m.is_public());
        assert!(m.is_static());
        assert!(!m.is_abstract());
        assert_eq!(Modifiers::from_bits(m.bits()), m);
    }

    #[test]
    fn test_assignability_follows_hierarchy() {
        let (object, shape, base, derived) = hierarchy();
        assert!(object.is_assignable_from(&derived));
        assert!(base.is_assignable_from(&derived));
        assert!(shape.is_assignable_from(&derived));
        assert!(!derived.is_assignable_from(&base));
        assert!(!shape.is_assignable_from(&object));
        assert!(derived.is_assignable_from(&derived));
    }

    #[test]
    fn test_primitives_only_assignable_from_themselves() {
        let object = ClassBuilder::class("Object").build();
        let int = ClassBuilder::primitive("int").build();
        let long = ClassBuilder::primitive("long").build();
        assert!(int.is_assignable_from(&int));
        assert!(!long.is_assignable_from(&int));
        assert!(!object.is_assignable_from(&int));
        assert!(!int.is_assignable_from(&object));
    }

    #[test]
    fn test_arrays_are_covariant() {
        let (object, _, base, derived) = hierarchy();
        let int = ClassBuilder::primitive("int").build();
        let base_array = ClassBuilder::array(&base, &object).build();
        let derived_array = ClassBuilder::array(&derived, &object).build();
        let int_array = ClassBuilder::array(&int, &object).build();

        assert_eq!(derived_array.name(), "Derived[]");
        assert!(base_array.is_assignable_from(&derived_array));
        assert!(!derived_array.is_assignable_from(&base_array));
        assert!(object.is_assignable_from(&int_array));
        assert!(!base_array.is_assignable_from(&base));
        assert!(!base_array.is_assignable_from(&int_array));
    }

    #[test]
    fn test_self_referencing_methods_do_not_leak() {
        let object = ClassBuilder::class("Object").build();
        let node = ClassBuilder::class("Node")
            .extends(&object)
            .method(MethodDef::new("next", vec![], TypeRef::This))
            .method(MethodDef::new("link", vec![TypeRef::This], TypeRef::from(&object)))
            .build();

        let next = &node.declared_methods()[0];
        assert!(Arc::ptr_eq(&next.return_type().unwrap(), &node));
        assert!(Arc::ptr_eq(&next.declaring_class().unwrap(), &node));
        assert_eq!(node.declared_methods()[1].arity(), 1);

        let weak = Arc::downgrade(&node);
        let method = node.declared_methods()[1].clone();
        drop(node);
        assert!(weak.upgrade().is_none());
        assert!(matches!(
            method.parameter_types(),
            Err(ReflectError::Unresolved(name)) if &*name == "link"
        ));
    }

    #[test]
    fn test_define_methods_once() {
        let object = ClassBuilder::class("Object").build();
        let string = ClassBuilder::class("String").extends(&object).build();
        assert!(object.declared_methods().is_empty());

        assert!(object.define_methods(vec![MethodDef::new(
            "toString",
            vec![],
            TypeRef::from(&string)
        )]));
        assert!(!object.define_methods(vec![]));
        assert_eq!(object.declared_methods().len(), 1);
    }

    #[test]
    fn test_fields_and_constructors() {
        let object = ClassBuilder::class("Object").build();
        let int = ClassBuilder::primitive("int").build();
        let node = ClassBuilder::class("Node")
            .extends(&object)
            .field(FieldDef::new("next", TypeRef::This))
            .field(FieldDef::new("count", TypeRef::from(&int)).with_modifiers(Modifiers::STATIC))
            .constructor(ConstructorDef::new(vec![]))
            .constructor(ConstructorDef::new(vec![TypeRef::This]).with_modifiers(Modifiers::SYNTHETIC))
            .build();

        let fields = node.declared_fields();
        assert_eq!(fields.len(), 2);
        assert!(Arc::ptr_eq(&fields[0].field_type().unwrap(), &node));
        assert!(fields[1].modifiers().is_static());
        assert!(Arc::ptr_eq(&fields[1].declaring_class().unwrap(), &node));

        let constructors = node.declared_constructors();
        assert_eq!(constructors[0].arity(), 0);
        assert!(constructors[1].modifiers().is_synthetic());
        assert!(constructors[1].has_parameter_types(&[node.clone()]));
        assert!(object.declared_fields().is_empty());
    }
}
