//! Tuple data model: elements, structural matching and total ordering.
//!
//! A tuple is an ordered sequence of heterogeneous elements. Two tuples
//! *match* when they have the same length and every element pair matches,
//! with `Any` acting as a wildcard on either side and `None` matching
//! nothing. A total order over tuples keeps the store's index
//! deterministic; `Any` compares equal to every element, so the order is
//! only lawful over *defined* tuples (the store never indexes anything
//! else).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Absolute tolerance for floating point comparison.
pub const FLOAT_PRECISION: f64 = 1e-7;

/// A single tuple element. The set of variants is closed: `Any` is the
/// query-only wildcard, `None` the invalid sentinel that never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Element {
    Int(i32),
    Float(f64),
    Str(String),
    Tuple(Tuple),
    Any,
    None,
}

impl Element {
    /// True if the element carries a concrete value (recursively so for
    /// nested tuples). `Any` and `None` are not defined.
    pub fn is_defined(&self) -> bool {
        match self {
            Element::Int(_) | Element::Float(_) | Element::Str(_) => true,
            Element::Tuple(t) => t.is_defined(),
            Element::Any | Element::None => false,
        }
    }

    /// True if the element is, or contains, the `None` sentinel.
    pub fn has_none(&self) -> bool {
        match self {
            Element::None => true,
            Element::Tuple(t) => t.has_none(),
            _ => false,
        }
    }

    /// Symmetric structural match. Same variant compares payloads
    /// (floats within [`FLOAT_PRECISION`]), `Any` matches any defined
    /// element on either side, `None` matches nothing.
    pub fn matches(&self, other: &Element) -> bool {
        match (self, other) {
            (Element::Int(a), Element::Int(b)) => a == b,
            (Element::Float(a), Element::Float(b)) => (a - b).abs() < FLOAT_PRECISION,
            (Element::Str(a), Element::Str(b)) => a == b,
            (Element::Tuple(a), Element::Tuple(b)) => a.matches(b),
            (Element::None, _) | (_, Element::None) => false,
            (Element::Any, _) | (_, Element::Any) => true,
            _ => false,
        }
    }

    /// Comparator for index ordering. Across variants the order is
    /// `Tuple < Str < Float < Int < None`; within a variant the natural
    /// payload order. `Any` compares equal to everything, which positions
    /// a wildcard query next to its match candidates in the index.
    pub fn order(&self, other: &Element) -> Ordering {
        if matches!(self, Element::Any) || matches!(other, Element::Any) {
            return Ordering::Equal;
        }
        match (self, other) {
            (Element::Int(a), Element::Int(b)) => a.cmp(b),
            (Element::Float(a), Element::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Element::Str(a), Element::Str(b)) => a.cmp(b),
            (Element::Tuple(a), Element::Tuple(b)) => a.order(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Element::Tuple(_) => 0,
            Element::Str(_) => 1,
            Element::Float(_) => 2,
            Element::Int(_) => 3,
            Element::None => 4,
            // never reached: Any is handled before ranking
            Element::Any => 0,
        }
    }

    /// Payload accessor for string elements.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Element::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Payload accessor for integer elements.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Element::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Int(i) => write!(f, "{}", i),
            Element::Float(x) => write!(f, "{}", x),
            Element::Str(s) => write!(f, "\"{}\"", s),
            Element::Tuple(t) => write!(f, "{}", t),
            Element::Any => write!(f, "_"),
            Element::None => write!(f, "nil"),
        }
    }
}

impl From<i32> for Element {
    fn from(v: i32) -> Self {
        Element::Int(v)
    }
}

impl From<f64> for Element {
    fn from(v: f64) -> Self {
        Element::Float(v)
    }
}

impl From<&str> for Element {
    fn from(v: &str) -> Self {
        Element::Str(v.to_string())
    }
}

impl From<String> for Element {
    fn from(v: String) -> Self {
        Element::Str(v)
    }
}

impl From<Tuple> for Element {
    fn from(v: Tuple) -> Self {
        Element::Tuple(v)
    }
}

/// An ordered finite sequence of elements. Length is part of identity:
/// tuples of different length never match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    elements: Vec<Element>,
}

impl Tuple {
    pub fn new(elements: Vec<Element>) -> Self {
        Tuple { elements }
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// True if no element is a wildcard or `None`, recursively.
    pub fn is_defined(&self) -> bool {
        self.elements.iter().all(Element::is_defined)
    }

    /// True if any element is, or contains, `None`.
    pub fn has_none(&self) -> bool {
        self.elements.iter().any(Element::has_none)
    }

    /// Symmetric structural match: equal length and element-wise match.
    pub fn matches(&self, other: &Tuple) -> bool {
        self.elements.len() == other.elements.len()
            && self
                .elements
                .iter()
                .zip(&other.elements)
                .all(|(a, b)| a.matches(b))
    }

    /// Index comparator: element-wise order on the shared prefix, then
    /// the shorter tuple is less.
    pub fn order(&self, other: &Tuple) -> Ordering {
        for (a, b) in self.elements.iter().zip(&other.elements) {
            match a.order(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.elements.len().cmp(&other.elements.len())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, ")")
    }
}

/// Build a [`Tuple`] from a list of values convertible to [`Element`].
///
/// ```
/// use lindad::{tuple, tuple::Element};
/// let query = tuple!["REQ", Element::Any, Element::Any];
/// assert_eq!(query.len(), 3);
/// ```
#[macro_export]
macro_rules! tuple {
    ($($e:expr),* $(,)?) => {
        $crate::tuple::Tuple::new(vec![$($crate::tuple::Element::from($e)),*])
    };
}
