//! Rendering a runtime [`Value`] as the text `print` and the disassembler's
//! constant column show a user.

use pd_core::{Heap, Object, Value};

pub fn display(value: &Value, heap: &Heap) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Double(d) => format!("{d}"),
        Value::Bool(b) => b.to_string(),
        Value::Character(c) => (*c as char).to_string(),
        Value::Pointer { .. } => "<pointer>".to_string(),
        Value::Object(handle) => match heap.get(*handle) {
            Object::String(s) => s.to_string(),
            Object::Memory(_) => "<memory>".to_string(),
            Object::Function(f) => format!("<fun {}>", heap.get(f.name).as_string().unwrap_or("?")),
            Object::Builtin(b) => format!("<builtin {}>", heap.get(b.name).as_string().unwrap_or("?")),
            Object::StructTemplate(t) => format!("<struct-template {}>", heap.get(t.name).as_string().unwrap_or("?")),
            Object::Struct(s) => {
                let template_name = match heap.get(s.template) {
                    Object::StructTemplate(t) => heap.get(t.name).as_string().unwrap_or("?").to_string(),
                    _ => "?".to_string(),
                };
                format!("<struct {template_name}>")
            }
            Object::Reference(inner) => display(inner, heap),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_primitives() {
        let heap = Heap::new();
        assert_eq!(display(&Value::Integer(5), &heap), "5");
        assert_eq!(display(&Value::Bool(true), &heap), "true");
        assert_eq!(display(&Value::Null, &heap), "null");
    }

    #[test]
    fn displays_interned_string() {
        let mut heap = Heap::new();
        let handle = heap.alloc(Object::String("hi".into()));
        assert_eq!(display(&Value::Object(handle), &heap), "hi");
    }

    #[test]
    fn reference_displays_the_wrapped_value() {
        let mut heap = Heap::new();
        let handle = heap.alloc(Object::Reference(Value::Integer(9)));
        assert_eq!(display(&Value::Object(handle), &heap), "9");
    }
}
