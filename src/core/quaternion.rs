//! Unit-quaternion orientation values.
//!
//! Every `Orientation` is stored as an exact unit quaternion. Input is
//! renormalized on construction, and a zero quaternion collapses to the
//! identity rotation.

use nalgebra::Quaternion;
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Deviation of an input norm from 1.0 beyond which the input is treated as
/// a malformed reading rather than quantization noise.
pub const NORM_TOLERANCE: f64 = 1e-3;

/// One quaternion component, in `(w, x, y, z)` naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    W,
    X,
    Y,
    Z,
}

impl Component {
    /// Components in feature-schema order.
    pub const ALL: [Component; 4] = [Component::W, Component::X, Component::Y, Component::Z];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::W => "w",
            Component::X => "x",
            Component::Y => "y",
            Component::Z => "z",
        }
    }
}

/// Mapping of four storage slots (wire or file) to quaternion components.
///
/// Firmware revisions disagree on the slot order, so this is carried as part
/// of the device profile rather than assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentOrder([Component; 4]);

impl ComponentOrder {
    /// `w, x, y, z` - current firmware notification layout.
    pub const WXYZ: ComponentOrder =
        ComponentOrder([Component::W, Component::X, Component::Y, Component::Z]);

    /// `x, y, z, w` - layout written by the recorders into stored recordings.
    pub const XYZW: ComponentOrder =
        ComponentOrder([Component::X, Component::Y, Component::Z, Component::W]);

    /// Build an order from four slots. Each component must appear exactly once.
    pub fn new(slots: [Component; 4]) -> Result<Self, OrderError> {
        for c in Component::ALL {
            if slots.iter().filter(|&&s| s == c).count() != 1 {
                return Err(OrderError(format!(
                    "component '{}' must appear exactly once",
                    c.as_str()
                )));
            }
        }
        Ok(Self(slots))
    }

    pub fn slots(&self) -> [Component; 4] {
        self.0
    }

    /// Build an orientation from slot values laid out in this order.
    pub fn assemble(&self, values: [f64; 4]) -> Orientation {
        let mut wxyz = [0.0; 4];
        for (slot, component) in self.0.iter().enumerate() {
            let target = match component {
                Component::W => 0,
                Component::X => 1,
                Component::Y => 2,
                Component::Z => 3,
            };
            wxyz[target] = values[slot];
        }
        Orientation::new(wxyz[0], wxyz[1], wxyz[2], wxyz[3])
    }

    /// Lay out an orientation's components in this order.
    pub fn arrange(&self, orientation: &Orientation) -> [f64; 4] {
        self.0.map(|c| orientation.component(c))
    }
}

impl Default for ComponentOrder {
    fn default() -> Self {
        Self::WXYZ
    }
}

impl std::fmt::Display for ComponentOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0 {
            f.write_str(c.as_str())?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ComponentOrder {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.trim().to_lowercase().chars().collect();
        if chars.len() != 4 {
            return Err(OrderError(format!("expected 4 components, got '{s}'")));
        }
        let mut slots = [Component::W; 4];
        for (slot, ch) in chars.iter().enumerate() {
            slots[slot] = match ch {
                'w' => Component::W,
                'x' => Component::X,
                'y' => Component::Y,
                'z' => Component::Z,
                other => return Err(OrderError(format!("unknown component '{other}'"))),
            };
        }
        Self::new(slots)
    }
}

impl TryFrom<String> for ComponentOrder {
    type Error = OrderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ComponentOrder> for String {
    fn from(order: ComponentOrder) -> Self {
        order.to_string()
    }
}

/// Invalid component order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderError(String);

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid component order: {}", self.0)
    }
}

impl std::error::Error for OrderError {}

/// A unit quaternion `(w, x, y, z)` describing a sensor orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "OrientationRepr", into = "OrientationRepr")]
pub struct Orientation(Quaternion<f64>);

impl Orientation {
    /// Build an orientation, renormalizing to unit length.
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self::from_quaternion(Quaternion::new(w, x, y, z))
    }

    /// The identity rotation `(1, 0, 0, 0)`.
    pub fn identity() -> Self {
        Self(Quaternion::identity())
    }

    fn from_quaternion(q: Quaternion<f64>) -> Self {
        let norm = q.norm();
        if !norm.is_finite() || norm == 0.0 {
            return Self::identity();
        }
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            tracing::trace!(norm, "Renormalized out-of-tolerance quaternion");
        }
        if norm == 1.0 {
            Self(q)
        } else {
            Self(q / norm)
        }
    }

    pub fn w(&self) -> f64 {
        self.0.w
    }

    pub fn x(&self) -> f64 {
        self.0.i
    }

    pub fn y(&self) -> f64 {
        self.0.j
    }

    pub fn z(&self) -> f64 {
        self.0.k
    }

    /// Value of a single component.
    pub fn component(&self, component: Component) -> f64 {
        match component {
            Component::W => self.w(),
            Component::X => self.x(),
            Component::Y => self.y(),
            Component::Z => self.z(),
        }
    }

    /// Components as `[w, x, y, z]`.
    pub fn to_wxyz(&self) -> [f64; 4] {
        [self.w(), self.x(), self.y(), self.z()]
    }

    pub fn norm(&self) -> f64 {
        self.0.norm()
    }

    /// Inverse rotation, the conjugate of the unit quaternion.
    pub fn inverse(&self) -> Self {
        Self(self.0.conjugate())
    }

    /// Rotation of `self` expressed relative to `other`: `inverse(other) * self`.
    pub fn relative_to(&self, other: &Orientation) -> Self {
        other.inverse() * *self
    }

    /// Component-wise comparison within `epsilon`.
    pub fn approx_eq(&self, other: &Orientation, epsilon: f64) -> bool {
        self.to_wxyz()
            .iter()
            .zip(other.to_wxyz().iter())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for Orientation {
    type Output = Orientation;

    fn mul(self, rhs: Orientation) -> Orientation {
        Orientation::from_quaternion(self.0 * rhs.0)
    }
}

/// Relative-joint orientation of sensor `a` with respect to sensor `b`.
pub fn relative(a: &Orientation, b: &Orientation) -> Orientation {
    a.relative_to(b)
}

#[derive(Serialize, Deserialize)]
struct OrientationRepr {
    w: f64,
    x: f64,
    y: f64,
    z: f64,
}

impl From<OrientationRepr> for Orientation {
    fn from(r: OrientationRepr) -> Self {
        Orientation::new(r.w, r.x, r.y, r.z)
    }
}

impl From<Orientation> for OrientationRepr {
    fn from(o: Orientation) -> Self {
        OrientationRepr {
            w: o.w(),
            x: o.x(),
            y: o.y(),
            z: o.z(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn sample_pairs() -> Vec<(Orientation, Orientation)> {
        vec![
            (
                Orientation::new(0.7071, 0.7071, 0.0, 0.0),
                Orientation::new(0.5, 0.5, 0.5, 0.5),
            ),
            (
                Orientation::new(0.9, -0.1, 0.3, 0.2),
                Orientation::new(0.2, 0.4, -0.8, 0.1),
            ),
            (Orientation::identity(), Orientation::new(0.0, 0.0, 1.0, 0.0)),
        ]
    }

    #[test]
    fn test_renormalizes_out_of_tolerance() {
        let q = Orientation::new(2.0, 0.0, 0.0, 0.0);
        assert!((q.norm() - 1.0).abs() < EPS);
        assert!((q.w() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_zero_quaternion_becomes_identity() {
        let q = Orientation::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(q, Orientation::identity());
    }

    #[test]
    fn test_in_tolerance_value_is_made_unit() {
        let q = Orientation::new(0.9995, 0.0, 0.0, 0.0);
        assert_eq!(q.w(), 1.0);

        let q = Orientation::new(0.7071, 0.7071, 0.0, 0.0);
        assert!((q.norm() - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        for (a, _) in sample_pairs() {
            let product = a.inverse() * a;
            assert!(product.approx_eq(&Orientation::identity(), EPS), "{product:?}");
        }
    }

    #[test]
    fn test_inverse_of_near_unit_input() {
        let q = Orientation::new(1.0005, 0.0, 0.0, 0.0);
        assert_eq!(q.inverse().w(), 1.0);

        let q = Orientation::new(0.70709, 0.0, 0.70712, 0.0);
        assert!((q.inverse() * q).approx_eq(&Orientation::identity(), EPS));
    }

    #[test]
    fn test_relative_antisymmetry() {
        for (a, b) in sample_pairs() {
            let ab = relative(&a, &b);
            let ba = relative(&b, &a);
            assert!(ab.approx_eq(&ba.inverse(), 1e-9));
        }
    }

    #[test]
    fn test_relative_of_self_is_identity() {
        let q = Orientation::new(0.5, 0.5, 0.5, 0.5);
        assert!(relative(&q, &q).approx_eq(&Orientation::identity(), EPS));
    }

    #[test]
    fn test_component_order_parsing() {
        assert_eq!("xyzw".parse::<ComponentOrder>().unwrap(), ComponentOrder::XYZW);
        assert_eq!("WXYZ".parse::<ComponentOrder>().unwrap(), ComponentOrder::WXYZ);
        assert!("wxyy".parse::<ComponentOrder>().is_err());
        assert!("wxy".parse::<ComponentOrder>().is_err());
    }

    #[test]
    fn test_component_order_assemble_and_arrange() {
        let q = Orientation::new(0.5, 0.5, -0.5, 0.5);
        let slots = ComponentOrder::XYZW.arrange(&q);
        assert_eq!(slots, [0.5, -0.5, 0.5, 0.5]);
        assert_eq!(ComponentOrder::XYZW.assemble(slots), q);
    }

    #[test]
    fn test_serde_uses_named_components() {
        let q = Orientation::new(0.0, 1.0, 0.0, 0.0);
        let json = serde_json::to_value(q).unwrap();
        assert_eq!(json["x"], 1.0);
        assert_eq!(json["w"], 0.0);
    }
}
