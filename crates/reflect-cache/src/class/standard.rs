//! Bootstrap class set

use super::{Class, ClassBuilder, ConstructorDef, FieldDef, MethodDef, Modifiers, TypeRef};
use std::sync::Arc;

/// The classes every runtime starts with
///
/// Holds the root class, `void` and the primitives, their boxed
/// counterparts, and the core collection hierarchy.
#[derive(Clone)]
#[allow(missing_docs)]
pub struct StandardClasses {
    pub object: Arc<Class>,
    pub string: Arc<Class>,
    pub number: Arc<Class>,
    pub comparable: Arc<Class>,
    pub object_array: Arc<Class>,

    pub void: Arc<Class>,
    pub boolean: Arc<Class>,
    pub byte: Arc<Class>,
    pub char: Arc<Class>,
    pub short: Arc<Class>,
    pub int: Arc<Class>,
    pub long: Arc<Class>,
    pub float: Arc<Class>,
    pub double: Arc<Class>,

    pub void_box: Arc<Class>,
    pub boolean_box: Arc<Class>,
    pub byte_box: Arc<Class>,
    pub char_box: Arc<Class>,
    pub short_box: Arc<Class>,
    pub int_box: Arc<Class>,
    pub long_box: Arc<Class>,
    pub float_box: Arc<Class>,
    pub double_box: Arc<Class>,

    pub iterable: Arc<Class>,
    pub collection: Arc<Class>,
    pub list: Arc<Class>,
    pub random_access: Arc<Class>,
    pub abstract_collection: Arc<Class>,
    pub abstract_list: Arc<Class>,
    pub array_list: Arc<Class>,
}

impl StandardClasses {
    /// Build the bootstrap classes
    pub fn new() -> Self {
        let object = ClassBuilder::class("Object")
            .constructor(ConstructorDef::new(vec![]))
            .build();

        let primitive = |name: &str| ClassBuilder::primitive(name).build();
        let void = primitive("void");
        let boolean = primitive("boolean");
        let byte = primitive("byte");
        let char = primitive("char");
        let short = primitive("short");
        let int = primitive("int");
        let long = primitive("long");
        let float = primitive("float");
        let double = primitive("double");

        let abstract_method = |name: &str, parameters: Vec<TypeRef>, return_type: &Arc<Class>| {
            MethodDef::new(name, parameters, TypeRef::from(return_type))
                .with_modifiers(Modifiers::PUBLIC | Modifiers::ABSTRACT)
        };
        let comparable = ClassBuilder::interface("Comparable")
            .method(abstract_method("compareTo", vec![TypeRef::from(&object)], &int))
            .build();

        let final_class = |name: &str, superclass: &Arc<Class>| {
            ClassBuilder::class(name)
                .extends(superclass)
                .modifiers(Modifiers::PUBLIC | Modifiers::FINAL)
        };
        let string = final_class("String", &object)
            .implements(&comparable)
            .method(MethodDef::new("length", vec![], TypeRef::from(&int)))
            .method(MethodDef::new("charAt", vec![TypeRef::from(&int)], TypeRef::from(&char)))
            .method(MethodDef::new("toString", vec![], TypeRef::This))
            .build();
        object.define_methods(vec![
            MethodDef::new("equals", vec![TypeRef::from(&object)], TypeRef::from(&boolean)),
            MethodDef::new("hashCode", vec![], TypeRef::from(&int)),
            MethodDef::new("toString", vec![], TypeRef::from(&string)),
        ]);

        let number = ClassBuilder::class("Number")
            .extends(&object)
            .modifiers(Modifiers::PUBLIC | Modifiers::ABSTRACT)
            .method(abstract_method("intValue", vec![], &int))
            .method(abstract_method("doubleValue", vec![], &double))
            .build();

        let numeric_box = |name: &str, primitive: &Arc<Class>| {
            let constant = Modifiers::PUBLIC | Modifiers::STATIC | Modifiers::FINAL;
            final_class(name, &number)
                .implements(&comparable)
                .field(FieldDef::new("MIN_VALUE", TypeRef::from(primitive)).with_modifiers(constant))
                .field(FieldDef::new("MAX_VALUE", TypeRef::from(primitive)).with_modifiers(constant))
                .field(FieldDef::new("value", TypeRef::from(primitive)).with_modifiers(Modifiers::PRIVATE | Modifiers::FINAL))
                .constructor(ConstructorDef::new(vec![TypeRef::from(primitive)]))
                .method(MethodDef::new("intValue", vec![], TypeRef::from(&int)))
                .method(MethodDef::new("doubleValue", vec![], TypeRef::from(&double)))
                .method(MethodDef::new("compareTo", vec![TypeRef::This], TypeRef::from(&int)))
                .method(
                    MethodDef::new("valueOf", vec![TypeRef::from(primitive)], TypeRef::This)
                        .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC),
                )
                .build()
        };
        let byte_box = numeric_box("Byte", &byte);
        let short_box = numeric_box("Short", &short);
        let int_box = numeric_box("Integer", &int);
        let long_box = numeric_box("Long", &long);
        let float_box = numeric_box("Float", &float);
        let double_box = numeric_box("Double", &double);
        let void_box = final_class("Void", &object).build();
        let boolean_box = final_class("Boolean", &object)
            .implements(&comparable)
            .method(MethodDef::new("booleanValue", vec![], TypeRef::from(&boolean)))
            .build();
        let char_box = final_class("Character", &object)
            .implements(&comparable)
            .method(MethodDef::new("charValue", vec![], TypeRef::from(&char)))
            .build();

        let iterable = ClassBuilder::interface("Iterable").build();
        let collection = ClassBuilder::interface("Collection")
            .implements(&iterable)
            .method(abstract_method("size", vec![], &int))
            .method(abstract_method("add", vec![TypeRef::from(&object)], &boolean))
            .build();
        let list = ClassBuilder::interface("List")
            .implements(&collection)
            .method(abstract_method("get", vec![TypeRef::from(&int)], &object))
            .build();
        let random_access = ClassBuilder::interface("RandomAccess").build();
        let abstract_collection = ClassBuilder::class("AbstractCollection")
            .extends(&object)
            .implements(&collection)
            .modifiers(Modifiers::PUBLIC | Modifiers::ABSTRACT)
            .method(MethodDef::new("add", vec![TypeRef::from(&object)], TypeRef::from(&boolean)))
            .method(MethodDef::new("toString", vec![], TypeRef::from(&string)))
            .build();
        let abstract_list = ClassBuilder::class("AbstractList")
            .extends(&abstract_collection)
            .implements(&list)
            .modifiers(Modifiers::PUBLIC | Modifiers::ABSTRACT)
            .method(MethodDef::new("add", vec![TypeRef::from(&object)], TypeRef::from(&boolean)))
            .method(MethodDef::new("hashCode", vec![], TypeRef::from(&int)))
            .build();
        let array_list = ClassBuilder::class("ArrayList")
            .extends(&abstract_list)
            .implements(&list)
            .implements(&random_access)
            .field(FieldDef::new("size", TypeRef::from(&int)).with_modifiers(Modifiers::PRIVATE))
            .constructor(ConstructorDef::new(vec![]))
            .constructor(ConstructorDef::new(vec![TypeRef::from(&int)]))
            .constructor(ConstructorDef::new(vec![TypeRef::from(&collection)]))
            .method(MethodDef::new("size", vec![], TypeRef::from(&int)))
            .method(MethodDef::new("get", vec![TypeRef::from(&int)], TypeRef::from(&object)))
            .method(MethodDef::new("add", vec![TypeRef::from(&object)], TypeRef::from(&boolean)))
            .method(MethodDef::new("clone", vec![], TypeRef::from(&object)))
            .build();

        let object_array = ClassBuilder::array(&object, &object).build();

        Self {
            object,
            string,
            number,
            comparable,
            object_array,
            void,
            boolean,
            byte,
            char,
            short,
            int,
            long,
            float,
            double,
            void_box,
            boolean_box,
            byte_box,
            char_box,
            short_box,
            int_box,
            long_box,
            float_box,
            double_box,
            iterable,
            collection,
            list,
            random_access,
            abstract_collection,
            abstract_list,
            array_list,
        }
    }

    /// Primitive types paired with their boxed counterparts
    pub fn boxing_pairs(&self) -> [(&Arc<Class>, &Arc<Class>); 9] {
        [
            (&self.void, &self.void_box),
            (&self.boolean, &self.boolean_box),
            (&self.byte, &self.byte_box),
            (&self.char, &self.char_box),
            (&self.short, &self.short_box),
            (&self.int, &self.int_box),
            (&self.long, &self.long_box),
            (&self.float, &self.float_box),
            (&self.double, &self.double_box),
        ]
    }
}

impl Default for StandardClasses {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StandardClasses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardClasses")
            .field("root", &self.object.name())
            .finish()
    }
}
