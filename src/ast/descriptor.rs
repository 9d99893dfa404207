//! Type and member descriptors.
//!
//! Descriptors identify types and members by name only. Nothing here is
//! resolved against a runtime; the known-type registry and the operator
//! registry decide what a name means on each side.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{PlanError, PlanResult};

pub mod well_known {
    pub const UNIT: &str = "Unit";
    pub const BOOL: &str = "Bool";
    pub const INT: &str = "Int";
    pub const FLOAT: &str = "Float";
    pub const STRING: &str = "String";
    pub const OBJECT: &str = "Object";
    pub const LIST: &str = "List";
    pub const PROPERTY_BAG: &str = "PropertyBag";
    pub const OBSERVABLE: &str = "Observable";
    pub const ENUMERABLE: &str = "Enumerable";
    pub const FUNCTION: &str = "Function";
    pub const EXCEPTION: &str = "Exception";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeDesc {
    Named {
        name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<TypeDesc>,
    },
    Array(Box<TypeDesc>),
    Function {
        params: Vec<TypeDesc>,
        ret: Box<TypeDesc>,
    },
    /// A type synthesized by the query author's compiler (anonymous records,
    /// closures). Never known on the remote side.
    Generated {
        name: String,
        fields: Vec<(String, TypeDesc)>,
    },
    /// Placeholder for the i-th type parameter of an open generic method.
    GenericParam(usize),
}

impl TypeDesc {
    pub fn named<S: Into<String>>(name: S) -> Self {
        TypeDesc::Named {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn generic<S: Into<String>>(name: S, args: Vec<TypeDesc>) -> Self {
        TypeDesc::Named {
            name: name.into(),
            args,
        }
    }

    pub fn unit() -> Self {
        Self::named(well_known::UNIT)
    }

    pub fn bool() -> Self {
        Self::named(well_known::BOOL)
    }

    pub fn int() -> Self {
        Self::named(well_known::INT)
    }

    pub fn float() -> Self {
        Self::named(well_known::FLOAT)
    }

    pub fn string() -> Self {
        Self::named(well_known::STRING)
    }

    pub fn object() -> Self {
        Self::named(well_known::OBJECT)
    }

    pub fn exception() -> Self {
        Self::named(well_known::EXCEPTION)
    }

    pub fn property_bag() -> Self {
        Self::named(well_known::PROPERTY_BAG)
    }

    pub fn list(element: TypeDesc) -> Self {
        Self::generic(well_known::LIST, vec![element])
    }

    pub fn observable(element: TypeDesc) -> Self {
        Self::generic(well_known::OBSERVABLE, vec![element])
    }

    pub fn enumerable(element: TypeDesc) -> Self {
        Self::generic(well_known::ENUMERABLE, vec![element])
    }

    pub fn function(params: Vec<TypeDesc>, ret: TypeDesc) -> Self {
        TypeDesc::Function {
            params,
            ret: Box::new(ret),
        }
    }

    pub fn array(element: TypeDesc) -> Self {
        TypeDesc::Array(Box::new(element))
    }

    /// Short tag used for dispatch: the name of a named type, otherwise the
    /// shape (`Array`, `Function`, `Generated`, `GenericParam`).
    pub fn tag(&self) -> &str {
        match self {
            TypeDesc::Named { name, .. } => name,
            TypeDesc::Array(_) => "Array",
            TypeDesc::Function { .. } => well_known::FUNCTION,
            TypeDesc::Generated { .. } => "Generated",
            TypeDesc::GenericParam(_) => "GenericParam",
        }
    }

    pub fn is_named(&self, name: &str) -> bool {
        matches!(self, TypeDesc::Named { name: n, .. } if n == name)
    }

    pub fn is_unit(&self) -> bool {
        self.is_named(well_known::UNIT)
    }

    /// Element type of sequence-like types.
    pub fn element_type(&self) -> Option<&TypeDesc> {
        match self {
            TypeDesc::Array(element) => Some(element),
            TypeDesc::Named { name, args }
                if args.len() == 1
                    && matches!(
                        name.as_str(),
                        well_known::LIST | well_known::OBSERVABLE | well_known::ENUMERABLE
                    ) =>
            {
                args.first()
            }
            _ => None,
        }
    }

    pub fn return_type(&self) -> Option<&TypeDesc> {
        match self {
            TypeDesc::Function { ret, .. } => Some(ret),
            _ => None,
        }
    }

    pub fn contains_generated(&self) -> bool {
        match self {
            TypeDesc::Generated { .. } => true,
            TypeDesc::Named { args, .. } => args.iter().any(TypeDesc::contains_generated),
            TypeDesc::Array(element) => element.contains_generated(),
            TypeDesc::Function { params, ret } => {
                params.iter().any(TypeDesc::contains_generated) || ret.contains_generated()
            }
            TypeDesc::GenericParam(_) => false,
        }
    }

    /// Replaces every generated type with the property-bag substitute.
    pub fn replace_generated(&self) -> TypeDesc {
        match self {
            TypeDesc::Generated { .. } => TypeDesc::property_bag(),
            TypeDesc::Named { name, args } => TypeDesc::Named {
                name: name.clone(),
                args: args.iter().map(TypeDesc::replace_generated).collect(),
            },
            TypeDesc::Array(element) => TypeDesc::array(element.replace_generated()),
            TypeDesc::Function { params, ret } => TypeDesc::function(
                params.iter().map(TypeDesc::replace_generated).collect(),
                ret.replace_generated(),
            ),
            TypeDesc::GenericParam(i) => TypeDesc::GenericParam(*i),
        }
    }

    /// Substitutes generic placeholders. Fails with the first index that has
    /// no argument.
    pub fn substitute(&self, args: &[TypeDesc]) -> Result<TypeDesc, usize> {
        Ok(match self {
            TypeDesc::GenericParam(i) => args.get(*i).cloned().ok_or(*i)?,
            TypeDesc::Named { name, args: inner } => TypeDesc::Named {
                name: name.clone(),
                args: inner
                    .iter()
                    .map(|t| t.substitute(args))
                    .collect::<Result<_, _>>()?,
            },
            TypeDesc::Array(element) => TypeDesc::array(element.substitute(args)?),
            TypeDesc::Function { params, ret } => TypeDesc::function(
                params
                    .iter()
                    .map(|t| t.substitute(args))
                    .collect::<Result<_, _>>()?,
                ret.substitute(args)?,
            ),
            TypeDesc::Generated { name, fields } => TypeDesc::Generated {
                name: name.clone(),
                fields: fields
                    .iter()
                    .map(|(n, t)| Ok((n.clone(), t.substitute(args)?)))
                    .collect::<Result<_, usize>>()?,
            },
        })
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, items: &[TypeDesc]) -> fmt::Result {
            for (i, t) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", t)?;
            }
            Ok(())
        }
        match self {
            TypeDesc::Named { name, args } if args.is_empty() => write!(f, "{}", name),
            TypeDesc::Named { name, args } => {
                write!(f, "{}<", name)?;
                list(f, args)?;
                write!(f, ">")
            }
            TypeDesc::Array(element) => write!(f, "{}[]", element),
            TypeDesc::Function { params, ret } => {
                write!(f, "fn(")?;
                list(f, params)?;
                write!(f, ") -> {}", ret)
            }
            TypeDesc::Generated { name, .. } => write!(f, "<generated {}>", name),
            TypeDesc::GenericParam(i) => write!(f, "T{}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDesc {
    pub declaring: TypeDesc,
    pub name: String,
    pub ty: TypeDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyDesc {
    pub declaring: TypeDesc,
    pub name: String,
    pub ty: TypeDesc,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub index_params: Vec<TypeDesc>,
}

impl PropertyDesc {
    pub fn new<S: Into<String>>(declaring: TypeDesc, name: S, ty: TypeDesc) -> Self {
        Self {
            declaring,
            name: name.into(),
            ty,
            index_params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstructorDesc {
    pub declaring: TypeDesc,
    pub params: Vec<TypeDesc>,
}

/// A method as declared, before type arguments are supplied.
///
/// `params` and `ret` may mention [`TypeDesc::GenericParam`] for each of the
/// `generic_arity` type parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodDefinition {
    pub declaring: TypeDesc,
    pub name: String,
    #[serde(default)]
    pub generic_arity: usize,
    pub params: Vec<TypeDesc>,
    pub ret: TypeDesc,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_extension: bool,
}

impl MethodDefinition {
    pub fn new<S: Into<String>>(
        declaring: TypeDesc,
        name: S,
        params: Vec<TypeDesc>,
        ret: TypeDesc,
    ) -> Self {
        Self {
            declaring,
            name: name.into(),
            generic_arity: 0,
            params,
            ret,
            is_static: false,
            is_extension: false,
        }
    }

    pub fn generic(mut self, arity: usize) -> Self {
        self.generic_arity = arity;
        self
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn extension(mut self) -> Self {
        self.is_static = true;
        self.is_extension = true;
        self
    }

    /// Closes the definition over `type_args`.
    pub fn make_generic(self, type_args: Vec<TypeDesc>) -> PlanResult<MethodDesc> {
        if type_args.len() != self.generic_arity {
            return Err(PlanError::GenericArity {
                method: self.name,
                expected: self.generic_arity,
                found: type_args.len(),
            });
        }
        Ok(MethodDesc {
            definition: self,
            type_args,
        })
    }
}

/// A method reference as used in a plan: an open definition plus the
/// supplied type arguments (empty for non-generic methods).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDesc {
    definition: MethodDefinition,
    type_args: Vec<TypeDesc>,
}

impl MethodDesc {
    /// Non-generic method.
    pub fn simple(definition: MethodDefinition) -> Self {
        Self {
            definition,
            type_args: Vec::new(),
        }
    }

    pub fn definition(&self) -> &MethodDefinition {
        &self.definition
    }

    pub fn type_args(&self) -> &[TypeDesc] {
        &self.type_args
    }

    pub fn declaring(&self) -> &TypeDesc {
        &self.definition.declaring
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn is_static(&self) -> bool {
        self.definition.is_static
    }

    pub fn is_extension(&self) -> bool {
        self.definition.is_extension
    }

    pub fn is_generic(&self) -> bool {
        self.definition.generic_arity > 0
    }

    pub fn parameter_types(&self) -> Vec<TypeDesc> {
        self.definition
            .params
            .iter()
            .map(|t| t.substitute(&self.type_args).unwrap_or_else(|_| t.clone()))
            .collect()
    }

    pub fn return_type(&self) -> TypeDesc {
        self.definition
            .ret
            .substitute(&self.type_args)
            .unwrap_or_else(|_| self.definition.ret.clone())
    }

    /// Splits a (possibly closed generic) method into its open definition and
    /// the supplied arguments, the form used for transmission.
    pub fn decompose(&self) -> (MethodDefinition, Vec<TypeDesc>) {
        (self.definition.clone(), self.type_args.clone())
    }

    pub fn key(&self) -> String {
        format!("{}.{}", self.definition.declaring.tag(), self.definition.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberDesc {
    Field(FieldDesc),
    Property(PropertyDesc),
    Method(MethodDesc),
    Constructor(ConstructorDesc),
}

impl MemberDesc {
    pub fn declaring(&self) -> &TypeDesc {
        match self {
            MemberDesc::Field(f) => &f.declaring,
            MemberDesc::Property(p) => &p.declaring,
            MemberDesc::Method(m) => m.declaring(),
            MemberDesc::Constructor(c) => &c.declaring,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MemberDesc::Field(f) => &f.name,
            MemberDesc::Property(p) => &p.name,
            MemberDesc::Method(m) => m.name(),
            MemberDesc::Constructor(_) => ".ctor",
        }
    }

    /// Type of the value produced by reading (or calling) the member.
    pub fn value_type(&self) -> TypeDesc {
        match self {
            MemberDesc::Field(f) => f.ty.clone(),
            MemberDesc::Property(p) => p.ty.clone(),
            MemberDesc::Method(m) => m.return_type(),
            MemberDesc::Constructor(c) => c.declaring.clone(),
        }
    }

    /// `Declaring.Name`, the lookup key used by registries.
    pub fn key(&self) -> String {
        format!("{}.{}", self.declaring().tag(), self.name())
    }

    /// The same member re-targeted at the property-bag substitute.
    pub fn retarget_to_bag(&self) -> MemberDesc {
        MemberDesc::Property(PropertyDesc::new(
            TypeDesc::property_bag(),
            self.name(),
            self.value_type().replace_generated(),
        ))
    }
}

impl fmt::Display for MemberDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn select_definition() -> MethodDefinition {
        MethodDefinition::new(
            TypeDesc::named(well_known::OBSERVABLE),
            "Select",
            vec![
                TypeDesc::observable(TypeDesc::GenericParam(0)),
                TypeDesc::function(vec![TypeDesc::GenericParam(0)], TypeDesc::GenericParam(1)),
            ],
            TypeDesc::observable(TypeDesc::GenericParam(1)),
        )
        .generic(2)
        .extension()
    }

    #[test]
    fn test_closed_generic_signature() {
        let method = select_definition()
            .make_generic(vec![TypeDesc::int(), TypeDesc::string()])
            .unwrap();
        assert_eq!(
            method.parameter_types(),
            vec![
                TypeDesc::observable(TypeDesc::int()),
                TypeDesc::function(vec![TypeDesc::int()], TypeDesc::string()),
            ]
        );
        assert_eq!(method.return_type(), TypeDesc::observable(TypeDesc::string()));
        assert_eq!(method.key(), "Observable.Select");
    }

    #[test]
    fn test_decompose_and_reclose() {
        let method = select_definition()
            .make_generic(vec![TypeDesc::int(), TypeDesc::int()])
            .unwrap();
        let (definition, args) = method.decompose();
        assert_eq!(definition.generic_arity, 2);
        assert_eq!(definition.make_generic(args).unwrap(), method);
    }

    #[test]
    fn test_generic_arity_mismatch() {
        let result = select_definition().make_generic(vec![TypeDesc::int()]);
        assert!(matches!(
            result,
            Err(PlanError::GenericArity {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_replace_generated() {
        let generated = TypeDesc::Generated {
            name: "<>f__AnonymousType0".to_string(),
            fields: vec![("x".to_string(), TypeDesc::int())],
        };
        let ty = TypeDesc::observable(generated);
        assert!(ty.contains_generated());
        assert_eq!(
            ty.replace_generated(),
            TypeDesc::observable(TypeDesc::property_bag())
        );
    }
}
