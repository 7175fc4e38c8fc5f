//! Dimension-token grammar and gravity box computation (spec §4.2/§4.3).
//!
//! A dimension token looks like `640x480`, `640x`, `x480`, or the 4-value
//! crop-box form `10x20x630x460`; tokens may be spread across several
//! option-bag keys and are merged positionally, with a later non-empty
//! value for an already-set position being a user error.

use crate::error::{DirpyError, Result};

/// The parsed 2- or 4-slot dimension vector from one or more `NxN` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqDims {
    pub slots: [Option<i64>; 4],
    pub len: usize,
}

/// Scan every option-bag key for the `NxN[xNxN]` shape, merging dimensions
/// found across multiple keys positionally. Mirrors `_get_req_dims`.
pub fn parse_req_dims<'a, I>(keys: I) -> Result<Option<ReqDims>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut dims: Vec<Option<i64>> = Vec::new();

    for key in keys.into_iter().filter(|k| k.contains('x')) {
        let parts: Vec<&str> = key.splitn(4, 'x').collect();
        let mut o_dims: Vec<Option<i64>> = Vec::with_capacity(parts.len());
        let mut parse_ok = true;
        for p in &parts {
            if p.is_empty() {
                o_dims.push(None);
            } else {
                match p.parse::<i64>() {
                    Ok(v) => o_dims.push(Some(v)),
                    Err(_) => {
                        parse_ok = false;
                        break;
                    }
                }
            }
        }
        if !parse_ok {
            continue;
        }

        if o_dims.len() > dims.len() {
            dims.resize(o_dims.len(), None);
        }

        for (i, v) in o_dims.into_iter().enumerate() {
            if let Some(v) = v {
                if dims[i].is_some() {
                    return Err(DirpyError::user("Each dimension must be defined only once"));
                }
                dims[i] = Some(v);
            }
        }
    }

    if dims.is_empty() || dims.iter().all(Option::is_none) {
        return Ok(None);
    }

    let len = dims.len();
    let mut slots = [None; 4];
    for (i, v) in dims.into_iter().enumerate() {
        slots[i] = v;
    }
    Ok(Some(ReqDims { slots, len }))
}

/// One of the 9 compass points plus center, used to place a resize/crop box
/// within (or around) the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gravity {
    N,
    Ne,
    E,
    Se,
    S,
    Sw,
    W,
    Nw,
    C,
}

impl Gravity {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "n" => Ok(Gravity::N),
            "ne" => Ok(Gravity::Ne),
            "e" => Ok(Gravity::E),
            "se" => Ok(Gravity::Se),
            "s" => Ok(Gravity::S),
            "sw" => Ok(Gravity::Sw),
            "w" => Ok(Gravity::W),
            "nw" => Ok(Gravity::Nw),
            "c" => Ok(Gravity::C),
            other => Err(DirpyError::user(format!("Unknown gravity: {other}"))),
        }
    }

    fn has_north(self) -> bool {
        matches!(self, Gravity::N | Gravity::Ne | Gravity::Nw)
    }
    fn has_south(self) -> bool {
        matches!(self, Gravity::S | Gravity::Se | Gravity::Sw)
    }
    fn has_west(self) -> bool {
        matches!(self, Gravity::W | Gravity::Nw | Gravity::Sw)
    }
    fn has_east(self) -> bool {
        matches!(self, Gravity::E | Gravity::Ne | Gravity::Se)
    }
}

/// A box in `(left, top, right, bottom)` form, matching PIL's crop-box
/// convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Box4 {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

/// Compute the gravity-adjusted box for placing a `req_x`x`req_y` region
/// within an `out_x`x`out_y` image. Mirrors `_get_new_dims` exactly,
/// including its integer-floor division via truncating `/2`.
pub fn gravity_box(gravity: Gravity, out_x: i64, out_y: i64, req_x: i64, req_y: i64) -> Box4 {
    let left = if gravity.has_west() {
        0
    } else if gravity.has_east() {
        (out_x - req_x).abs()
    } else {
        (out_x - req_x).abs() / 2
    };

    let top = if gravity.has_north() {
        0
    } else if gravity.has_south() {
        (out_y - req_y).abs()
    } else {
        (out_y - req_y).abs() / 2
    };

    let right = left + req_x.min(out_x);
    let bottom = top + req_y.min(out_y);

    Box4 { left, top, right, bottom }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_wxh_token() {
        let dims = parse_req_dims(["640x480"]).unwrap().unwrap();
        assert_eq!(dims.slots[0], Some(640));
        assert_eq!(dims.slots[1], Some(480));
        assert_eq!(dims.len, 2);
    }

    #[test]
    fn allows_dropping_one_dimension() {
        let dims = parse_req_dims(["640x"]).unwrap().unwrap();
        assert_eq!(dims.slots[0], Some(640));
        assert_eq!(dims.slots[1], None);

        let dims = parse_req_dims(["x480"]).unwrap().unwrap();
        assert_eq!(dims.slots[0], None);
        assert_eq!(dims.slots[1], Some(480));
    }

    #[test]
    fn merges_across_multiple_keys() {
        let dims = parse_req_dims(["640x", "x480"]).unwrap().unwrap();
        assert_eq!(dims.slots[0], Some(640));
        assert_eq!(dims.slots[1], Some(480));
    }

    #[test]
    fn rejects_double_set_dimension() {
        let err = parse_req_dims(["640x480", "320x"]).unwrap_err();
        assert!(matches!(err, DirpyError::User { .. }));
    }

    #[test]
    fn four_value_crop_box_token() {
        let dims = parse_req_dims(["10x20x630x460"]).unwrap().unwrap();
        assert_eq!(dims.len, 4);
        assert_eq!(dims.slots, [Some(10), Some(20), Some(630), Some(460)]);
    }

    #[test]
    fn gravity_nw_pins_to_origin() {
        let b = gravity_box(Gravity::Nw, 1000, 800, 400, 300);
        assert_eq!(b.left, 0);
        assert_eq!(b.top, 0);
        assert_eq!(b.right, 400);
        assert_eq!(b.bottom, 300);
    }

    #[test]
    fn gravity_center_splits_remainder() {
        let b = gravity_box(Gravity::C, 1000, 800, 400, 300);
        assert_eq!(b.left, 300);
        assert_eq!(b.top, 250);
    }

    #[test]
    fn gravity_se_pins_to_far_corner() {
        let b = gravity_box(Gravity::Se, 1000, 800, 400, 300);
        assert_eq!(b.left, 600);
        assert_eq!(b.top, 500);
    }
}
