// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Range expression lists such as `[0-7/2,9,12-13]`.
//!
//! Each element is a single value, an inclusive `lo-hi` range, or a strided
//! `lo-hi/stride` range. A bare expression without brackets holds a single
//! element.

use anyhow::bail;
use anyhow::Result;
use sscanf::sscanf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeExpr {
    pub lo: usize,
    pub hi: usize,
    pub stride: usize,
}

impl RangeExpr {
    pub fn matches(&self, value: usize) -> bool {
        value >= self.lo && value <= self.hi && (value - self.lo) % self.stride == 0
    }

    fn parse(expr: &str, min: usize, max: usize) -> Result<RangeExpr> {
        let expr = expr.trim();
        let (lo, hi, stride) = if let Ok((lo, hi, stride)) = sscanf!(expr, "{usize}-{usize}/{usize}") {
            (lo, hi, stride)
        } else if let Ok((lo, hi)) = sscanf!(expr, "{usize}-{usize}") {
            (lo, hi, 1)
        } else if let Ok(val) = sscanf!(expr, "{usize}") {
            (val, val, 1)
        } else {
            bail!("Invalid range expression '{}'", expr);
        };

        if stride == 0 {
            bail!("Zero stride in range expression '{}'", expr);
        }
        if lo > hi || lo < min || hi > max {
            bail!(
                "Range expression '{}' outside of [{}, {}]",
                expr,
                min,
                max
            );
        }
        Ok(RangeExpr { lo, hi, stride })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExprList {
    exprs: Vec<RangeExpr>,
}

impl ExprList {
    /// Parse `list`, accepting values in `[min, max]`.
    pub fn parse(list: &str, min: usize, max: usize) -> Result<ExprList> {
        let list = list.trim();
        let body = match list.strip_prefix('[') {
            Some(rest) => match rest.strip_suffix(']') {
                Some(body) => body,
                None => bail!("Missing right bracket in '{}'", list),
            },
            None => {
                return Ok(ExprList {
                    exprs: vec![RangeExpr::parse(list, min, max)?],
                })
            }
        };

        let mut exprs = vec![];
        for expr in body.split(',') {
            if expr.trim().is_empty() {
                bail!("Empty element in '{}'", list);
            }
            exprs.push(RangeExpr::parse(expr, min, max)?);
        }
        Ok(ExprList { exprs })
    }

    pub fn matches(&self, value: usize) -> bool {
        self.exprs.iter().any(|e| e.matches(value))
    }

    /// All matching values in ascending order, without duplicates.
    pub fn values(&self) -> Vec<usize> {
        let mut values: Vec<usize> = self
            .exprs
            .iter()
            .flat_map(|e| (e.lo..=e.hi).step_by(e.stride))
            .collect();
        values.sort_unstable();
        values.dedup();
        values
    }
}
