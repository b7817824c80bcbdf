//! Position mapping through document changes.
//!
//! A [`StepMap`] describes the ranges a single step replaced. A [`Mapping`]
//! chains step maps so that a position in an old document can be carried
//! forward to the matching position in a newer one.
//!
//! Mirrors connect a map with a later map that undoes it (an inverted step
//! followed by its rebased re-application). When a position is deleted by
//! the first map of such a pair, the mapping jumps straight to the mirror
//! and recovers the exact original position instead of collapsing it.

use serde::{Deserialize, Serialize};

const DEL_BEFORE: u8 = 1;
const DEL_AFTER: u8 = 2;
const DEL_ACROSS: u8 = 4;
const DEL_SIDE: u8 = 8;

/// Which side a position sticks to when content is inserted at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Assoc {
    /// Stay before inserted content.
    Before,
    /// Move after inserted content.
    After,
}

/// A replaced range: `old_size` characters at `start` became `new_size` characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapRange {
    pub start: usize,
    pub old_size: usize,
    pub new_size: usize,
}

/// Token that allows a position deleted by a map to be restored by its mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Recover {
    index: usize,
    offset: usize,
}

/// The result of mapping a position, including deletion information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    del_info: u8,
    recover: Option<Recover>,
}

impl MapResult {
    /// The content on the side the position was associated with was deleted.
    pub fn deleted(&self) -> bool {
        self.del_info & DEL_SIDE > 0
    }

    /// The content directly before the position was deleted.
    pub fn deleted_before(&self) -> bool {
        self.del_info & (DEL_BEFORE | DEL_ACROSS) > 0
    }

    /// The content directly after the position was deleted.
    pub fn deleted_after(&self) -> bool {
        self.del_info & (DEL_AFTER | DEL_ACROSS) > 0
    }

    /// The position was strictly inside a deleted range.
    pub fn deleted_across(&self) -> bool {
        self.del_info & DEL_ACROSS > 0
    }

    pub fn recover(&self) -> Option<Recover> {
        self.recover
    }
}

/// The position map of a single step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMap {
    ranges: Vec<MapRange>,
    inverted: bool,
}

impl StepMap {
    /// Create a map from ranges sorted by start position (in the old document).
    pub fn new(ranges: Vec<MapRange>) -> Self {
        Self {
            ranges: ranges
                .into_iter()
                .filter(|r| r.old_size != 0 || r.new_size != 0)
                .collect(),
            inverted: false,
        }
    }

    /// A map that leaves every position unchanged.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[MapRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Map a position.
    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    /// Map a position, returning deletion and recovery information.
    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut diff: isize = 0;
        for (index, range) in self.ranges.iter().enumerate() {
            let (old_size, new_size) = self.sizes(range);
            let start = if self.inverted {
                offset(range.start, -diff)
            } else {
                range.start
            };
            if start > pos {
                break;
            }
            let end = start + old_size;
            if pos <= end {
                let side = if old_size == 0 {
                    assoc
                } else if pos == start {
                    Assoc::Before
                } else if pos == end {
                    Assoc::After
                } else {
                    assoc
                };
                let result = offset(start, diff)
                    + match side {
                        Assoc::Before => 0,
                        Assoc::After => new_size,
                    };
                let stuck = match assoc {
                    Assoc::Before => start,
                    Assoc::After => end,
                };
                let recover = (pos != stuck).then_some(Recover {
                    index,
                    offset: pos - start,
                });
                let mut del_info = if pos == start {
                    DEL_AFTER
                } else if pos == end {
                    DEL_BEFORE
                } else {
                    DEL_ACROSS
                };
                if pos != stuck {
                    del_info |= DEL_SIDE;
                }
                return MapResult {
                    pos: result,
                    del_info,
                    recover,
                };
            }
            diff += new_size as isize - old_size as isize;
        }
        MapResult {
            pos: offset(pos, diff),
            del_info: 0,
            recover: None,
        }
    }

    /// Restore a position from a recovery token produced by the map this one mirrors.
    pub fn recover(&self, value: Recover) -> usize {
        let mut diff: isize = 0;
        if !self.inverted {
            for range in &self.ranges[..value.index] {
                diff += range.new_size as isize - range.old_size as isize;
            }
        }
        offset(self.ranges[value.index].start, diff) + value.offset
    }

    /// Call `f(old_start, old_end, new_start, new_end)` for every changed range.
    pub fn for_each(&self, mut f: impl FnMut(usize, usize, usize, usize)) {
        let mut diff: isize = 0;
        for range in &self.ranges {
            let (old_size, new_size) = self.sizes(range);
            let start = if self.inverted {
                offset(range.start, -diff)
            } else {
                range.start
            };
            let new_start = offset(start, diff);
            f(start, start + old_size, new_start, new_start + new_size);
            diff += new_size as isize - old_size as isize;
        }
    }

    /// A map that undoes this one.
    pub fn invert(&self) -> StepMap {
        StepMap {
            ranges: self.ranges.clone(),
            inverted: !self.inverted,
        }
    }

    fn sizes(&self, range: &MapRange) -> (usize, usize) {
        if self.inverted {
            (range.new_size, range.old_size)
        } else {
            (range.old_size, range.new_size)
        }
    }
}

fn offset(pos: usize, diff: isize) -> usize {
    (pos as isize + diff).max(0) as usize
}

/// A chain of step maps, optionally with mirror pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mapping {
    maps: Vec<StepMap>,
    mirror: Vec<(usize, usize)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_maps(maps: Vec<StepMap>) -> Self {
        Self {
            maps,
            mirror: Vec::new(),
        }
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Create a mapping covering only the maps in `from..to`.
    ///
    /// Mirror pairs with both ends inside the range are preserved.
    pub fn slice(&self, from: usize, to: usize) -> Mapping {
        let to = to.min(self.maps.len());
        let from = from.min(to);
        Mapping {
            maps: self.maps[from..to].to_vec(),
            mirror: self
                .mirror
                .iter()
                .filter(|(a, b)| (from..to).contains(a) && (from..to).contains(b))
                .map(|(a, b)| (a - from, b - from))
                .collect(),
        }
    }

    /// Shorthand for slicing from `from` to the end.
    pub fn slice_from(&self, from: usize) -> Mapping {
        self.slice(from, self.maps.len())
    }

    /// Add a map to the end, optionally marking it as the mirror of an earlier one.
    pub fn append_map(&mut self, map: StepMap, mirrors: Option<usize>) {
        self.maps.push(map);
        if let Some(mirrors) = mirrors {
            self.set_mirror(self.maps.len() - 1, mirrors);
        }
    }

    /// Append all maps of another mapping, preserving its mirrors.
    pub fn append_mapping(&mut self, other: &Mapping) {
        let start = self.maps.len();
        for (i, map) in other.maps.iter().enumerate() {
            let mirror = other
                .get_mirror(i)
                .filter(|m| *m < i)
                .map(|m| start + m);
            self.append_map(map.clone(), mirror);
        }
    }

    /// Declare the maps at `n` and `m` as mirrors of each other.
    pub fn set_mirror(&mut self, n: usize, m: usize) {
        self.mirror.push((n, m));
    }

    pub fn get_mirror(&self, n: usize) -> Option<usize> {
        self.mirror.iter().find_map(|&(a, b)| {
            if a == n {
                Some(b)
            } else if b == n {
                Some(a)
            } else {
                None
            }
        })
    }

    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut pos = pos;
        let mut del_info = 0;
        let mut i = 0;
        while i < self.maps.len() {
            let result = self.maps[i].map_result(pos, assoc);
            if let Some(recover) = result.recover {
                if let Some(corr) = self.get_mirror(i).filter(|corr| *corr > i) {
                    pos = self.maps[corr].recover(recover);
                    i = corr + 1;
                    continue;
                }
            }
            del_info |= result.del_info;
            pos = result.pos;
            i += 1;
        }
        MapResult {
            pos,
            del_info,
            recover: None,
        }
    }
}

impl From<StepMap> for Mapping {
    fn from(map: StepMap) -> Self {
        Mapping::from_maps(vec![map])
    }
}
