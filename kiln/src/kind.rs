use crate::{VmError, VmResult};

/// Storage class of a value on the operand stack, in a local, field or array
/// element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference,
    Void,
}

impl Kind {
    /// Number of arena slots a value of this kind occupies.
    pub const fn slot_count(self) -> usize {
        match self {
            Kind::Long | Kind::Double => 2,
            Kind::Void => 0,
            _ => 1,
        }
    }

    pub const fn is_two_slot(self) -> bool {
        matches!(self, Kind::Long | Kind::Double)
    }

    /// Kinds narrower than int are widened to `Int` on the operand stack.
    pub const fn stack_kind(self) -> Kind {
        match self {
            Kind::Boolean | Kind::Byte | Kind::Char | Kind::Short => Kind::Int,
            other => other,
        }
    }

    pub fn from_descriptor_char(c: char) -> Option<Kind> {
        Some(match c {
            'Z' => Kind::Boolean,
            'B' => Kind::Byte,
            'C' => Kind::Char,
            'S' => Kind::Short,
            'I' => Kind::Int,
            'F' => Kind::Float,
            'J' => Kind::Long,
            'D' => Kind::Double,
            'L' | '[' => Kind::Reference,
            'V' => Kind::Void,
            _ => return None,
        })
    }
}

/// Parsed `(args)ret` method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub arguments: Vec<Kind>,
    pub return_kind: Kind,
}

impl MethodDescriptor {
    /// Argument slots, excluding any receiver.
    pub fn argument_slots(&self) -> usize {
        self.arguments.iter().map(|k| k.slot_count()).sum()
    }
}

/// Parse a field type descriptor starting at `chars`, consuming exactly one
/// type.
fn parse_field_type(
    descriptor: &str,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> VmResult<Kind> {
    let invalid = || VmError::Descriptor(descriptor.to_string());
    let c = chars.next().ok_or_else(invalid)?;
    match c {
        'L' => {
            for c in chars.by_ref() {
                if c == ';' {
                    return Ok(Kind::Reference);
                }
            }
            Err(invalid())
        }
        '[' => {
            parse_field_type(descriptor, chars)?;
            Ok(Kind::Reference)
        }
        'V' => Err(invalid()),
        other => Kind::from_descriptor_char(other).ok_or_else(invalid),
    }
}

pub fn parse_field_descriptor(descriptor: &str) -> VmResult<Kind> {
    let mut chars = descriptor.chars().peekable();
    let kind = parse_field_type(descriptor, &mut chars)?;
    if chars.next().is_some() {
        return Err(VmError::Descriptor(descriptor.to_string()));
    }
    Ok(kind)
}

pub fn parse_method_descriptor(descriptor: &str) -> VmResult<MethodDescriptor> {
    let invalid = || VmError::Descriptor(descriptor.to_string());
    let mut chars = descriptor.chars().peekable();
    if chars.next() != Some('(') {
        return Err(invalid());
    }

    let mut arguments = Vec::new();
    loop {
        match chars.peek() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => arguments.push(parse_field_type(descriptor, &mut chars)?),
            None => return Err(invalid()),
        }
    }

    let return_kind = match chars.peek() {
        Some('V') => {
            chars.next();
            Kind::Void
        }
        Some(_) => parse_field_type(descriptor, &mut chars)?,
        None => return Err(invalid()),
    };
    if chars.next().is_some() {
        return Err(invalid());
    }

    Ok(MethodDescriptor {
        arguments,
        return_kind,
    })
}
