//! ABOUTME: Custom type table and structural type compatibility
//! ABOUTME: Folds built-in domain types into every application's type space

use crate::ir::CustomTypeIr;
use indexmap::IndexMap;
use qtype_core::types::domain::builtin_domain_types;
use qtype_core::{codes, Diagnostic, TypeRef};
use qtype_dsl::document::{CustomTypeShape, Application};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resolved custom types, including the built-in domain shapes.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: BTreeMap<String, Arc<CustomTypeIr>>,
}

impl TypeTable {
    /// Build the table from the application's declarations. Built-in domain
    /// types are always present; a document may not shadow them.
    pub fn build(app: &Application, diags: &mut Vec<Diagnostic>) -> Self {
        let mut types = BTreeMap::new();
        for def in builtin_domain_types() {
            let fields: IndexMap<String, TypeRef> = def
                .fields
                .iter()
                .map(|f| (f.name.to_string(), f.ty.clone()))
                .collect();
            types.insert(
                def.name.to_string(),
                Arc::new(CustomTypeIr::Object {
                    id: def.name.to_string(),
                    fields,
                }),
            );
        }

        for def in &app.types {
            if types.contains_key(&def.id) {
                diags.push(Diagnostic::new(
                    codes::DUPLICATE_ID,
                    format!("custom type '{}' shadows an existing type", def.id),
                ));
                continue;
            }
            let ir = match &def.shape {
                CustomTypeShape::Object { fields } => CustomTypeIr::Object {
                    id: def.id.clone(),
                    fields: fields.clone(),
                },
                CustomTypeShape::Array { element } => CustomTypeIr::Array {
                    id: def.id.clone(),
                    element: element.clone(),
                },
            };
            types.insert(def.id.clone(), Arc::new(ir));
        }

        let table = Self { types };
        table.check_closed(app, diags);
        table
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<CustomTypeIr>> {
        self.types.get(id)
    }

    #[must_use]
    pub fn all(&self) -> &BTreeMap<String, Arc<CustomTypeIr>> {
        &self.types
    }

    /// Every custom name a declared type mentions must exist.
    fn check_closed(&self, app: &Application, diags: &mut Vec<Diagnostic>) {
        for def in &app.types {
            match &def.shape {
                CustomTypeShape::Object { fields } => {
                    for (field, ty) in fields {
                        self.check_known(ty, &format!("type '{}', field '{field}'", def.id), diags);
                    }
                }
                CustomTypeShape::Array { element } => {
                    self.check_known(element, &format!("type '{}'", def.id), diags);
                }
            }
        }
    }

    pub fn check_known(&self, ty: &TypeRef, context: &str, diags: &mut Vec<Diagnostic>) {
        match ty {
            TypeRef::Primitive(_) => {}
            TypeRef::Custom(name) => {
                if !self.types.contains_key(name) {
                    diags.push(Diagnostic::new(
                        codes::TYPE_UNKNOWN,
                        format!("{context} references unknown type '{name}'"),
                    ));
                }
            }
            TypeRef::List(inner) | TypeRef::Optional(inner) => {
                self.check_known(inner, context, diags);
            }
        }
    }

    /// Structural compatibility of a producer type with a consumer slot.
    ///
    /// Identical primitives match; lists match when elements do; a
    /// non-optional producer satisfies an optional consumer (never the
    /// reverse); object custom types are assignable when every required
    /// consumer field exists on the producer with a compatible type.
    #[must_use]
    pub fn compatible(&self, producer: &TypeRef, consumer: &TypeRef) -> bool {
        let mut visiting = Vec::new();
        self.compatible_inner(producer, consumer, &mut visiting)
    }

    fn compatible_inner(
        &self,
        producer: &TypeRef,
        consumer: &TypeRef,
        visiting: &mut Vec<(String, String)>,
    ) -> bool {
        match (producer, consumer) {
            // Optional collapse is explicit: T? never satisfies T.
            (TypeRef::Optional(p), TypeRef::Optional(c)) => {
                self.compatible_inner(p, c, visiting)
            }
            (p, TypeRef::Optional(c)) => self.compatible_inner(p, c, visiting),
            (TypeRef::Optional(_), _) => false,

            (TypeRef::Primitive(p), TypeRef::Primitive(c)) => p == c,
            (TypeRef::List(p), TypeRef::List(c)) => self.compatible_inner(p, c, visiting),

            (TypeRef::Custom(p), TypeRef::Custom(c)) => {
                if p == c {
                    return true;
                }
                let key = (p.clone(), c.clone());
                if visiting.contains(&key) {
                    // Recursive shapes are assumed compatible at the knot.
                    return true;
                }
                visiting.push(key);
                let result = self.customs_assignable(p, c, visiting);
                visiting.pop();
                result
            }

            // Array custom types behave as their list normalization.
            (TypeRef::Custom(p), TypeRef::List(_)) => self
                .array_element(p)
                .is_some_and(|elem| {
                    self.compatible_inner(&TypeRef::list(elem), consumer, visiting)
                }),
            (TypeRef::List(_), TypeRef::Custom(c)) => self
                .array_element(c)
                .is_some_and(|elem| {
                    self.compatible_inner(producer, &TypeRef::list(elem), visiting)
                }),

            _ => false,
        }
    }

    fn array_element(&self, id: &str) -> Option<TypeRef> {
        match self.types.get(id).map(Arc::as_ref) {
            Some(CustomTypeIr::Array { element, .. }) => Some(element.clone()),
            _ => None,
        }
    }

    fn customs_assignable(
        &self,
        producer: &str,
        consumer: &str,
        visiting: &mut Vec<(String, String)>,
    ) -> bool {
        let (Some(p), Some(c)) = (self.types.get(producer), self.types.get(consumer)) else {
            return false;
        };
        match (p.as_ref(), c.as_ref()) {
            (
                CustomTypeIr::Object {
                    fields: p_fields, ..
                },
                CustomTypeIr::Object {
                    fields: c_fields, ..
                },
            ) => {
                let p_fields = p_fields.clone();
                let c_fields = c_fields.clone();
                c_fields.iter().all(|(name, c_ty)| {
                    if c_ty.is_optional() {
                        // Optional consumer fields may be absent entirely.
                        p_fields
                            .get(name)
                            .is_none_or(|p_ty| self.compatible_inner(p_ty, c_ty, visiting))
                    } else {
                        p_fields
                            .get(name)
                            .is_some_and(|p_ty| self.compatible_inner(p_ty, c_ty, visiting))
                    }
                })
            }
            (
                CustomTypeIr::Array {
                    element: p_elem, ..
                },
                CustomTypeIr::Array {
                    element: c_elem, ..
                },
            ) => {
                let (p_elem, c_elem) = (p_elem.clone(), c_elem.clone());
                self.compatible_inner(&p_elem, &c_elem, visiting)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtype_core::PrimitiveKind;

    fn table_with(yaml_types: &str) -> TypeTable {
        let app: Application =
            serde_yaml::from_str(&format!("id: app\ntypes:\n{yaml_types}")).unwrap();
        let mut diags = Vec::new();
        let table = TypeTable::build(&app, &mut diags);
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        table
    }

    #[test]
    fn primitives_match_exactly() {
        let table = TypeTable::build(&Application::default(), &mut Vec::new());
        let text = TypeRef::primitive(PrimitiveKind::Text);
        let int = TypeRef::primitive(PrimitiveKind::Int);
        assert!(table.compatible(&text, &text));
        assert!(!table.compatible(&text, &int));
    }

    #[test]
    fn optional_collapse_is_one_way() {
        let table = TypeTable::build(&Application::default(), &mut Vec::new());
        let text = TypeRef::primitive(PrimitiveKind::Text);
        let opt_text = TypeRef::optional(text.clone());
        assert!(table.compatible(&text, &opt_text));
        assert!(!table.compatible(&opt_text, &text));
    }

    #[test]
    fn structural_object_assignability() {
        let table = table_with(
            "  - id: Person\n    fields:\n      name: text\n      age: int\n  - id: Named\n    fields:\n      name: text\n",
        );
        let person = TypeRef::Custom("Person".to_string());
        let named = TypeRef::Custom("Named".to_string());
        assert!(table.compatible(&person, &named));
        assert!(!table.compatible(&named, &person));
    }

    #[test]
    fn array_customs_normalize_to_lists() {
        let table = table_with("  - id: Names\n    element: text\n");
        let names = TypeRef::Custom("Names".to_string());
        let list_text = TypeRef::list(TypeRef::primitive(PrimitiveKind::Text));
        assert!(table.compatible(&names, &list_text));
        assert!(table.compatible(&list_text, &names));
    }

    #[test]
    fn domain_types_are_always_present() {
        let table = TypeTable::build(&Application::default(), &mut Vec::new());
        assert!(table.get("ChatMessage").is_some());
        assert!(table.get("AggregateStats").is_some());
    }

    // Metadata has no required fields, so any structured type fits the
    // metadata slots of the retrieval domain types; the reverse needs the
    // consumer's fields and is rejected.
    #[test]
    fn any_object_type_satisfies_metadata() {
        let table = table_with(
            "  - id: SourceInfo\n    fields:\n      origin: text\n      page: int\n",
        );
        let metadata = TypeRef::Custom("Metadata".to_string());
        let source_info = TypeRef::Custom("SourceInfo".to_string());
        assert!(table.compatible(&source_info, &metadata));
        assert!(table.compatible(&source_info, &TypeRef::optional(metadata.clone())));
        assert!(!table.compatible(&metadata, &source_info));
        assert!(!table.compatible(&TypeRef::primitive(PrimitiveKind::Text), &metadata));
    }

    #[test]
    fn unknown_custom_reference_is_diagnosed() {
        let app: Application = serde_yaml::from_str(
            "id: app\ntypes:\n  - id: Holder\n    fields:\n      inner: Missing\n",
        )
        .unwrap();
        let mut diags = Vec::new();
        TypeTable::build(&app, &mut diags);
        assert!(diags.iter().any(|d| d.code == codes::TYPE_UNKNOWN));
    }
}
