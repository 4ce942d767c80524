//! Pull-based document sequences connecting pipeline stages.
//!
//! Nothing runs until a consumer calls `next`. Every combinator is its own
//! iterator type; `Lazy` boxes whichever one a stage produced so stages can
//! be chained without naming the concrete type. All sequences are single
//! pass and stay exhausted once they return `None`.

use std::collections::VecDeque;

use crate::error::Result;
use crate::value::Value;

pub struct Lazy<'a> {
    iter: Box<dyn Iterator<Item = Result<Value>> + 'a>,
}

impl<'a> Lazy<'a> {
    pub fn new<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<Value>> + 'a,
    {
        Lazy {
            iter: Box::new(iter.fuse()),
        }
    }

    /// Array-backed sequence.
    pub fn from_vec(docs: Vec<Value>) -> Self {
        Self::new(docs.into_iter().map(Ok))
    }

    pub fn from_values<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: 'a,
    {
        Self::new(docs.into_iter().map(Ok))
    }

    /// Generator-backed sequence; `f` is called once per pull.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut() -> Option<Result<Value>> + 'a,
    {
        Self::new(std::iter::from_fn(f))
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn map<F>(self, f: F) -> Lazy<'a>
    where
        F: FnMut(Value) -> Result<Value> + 'a,
    {
        Lazy::new(Map { upstream: self, f })
    }

    pub fn filter<F>(self, f: F) -> Lazy<'a>
    where
        F: FnMut(&Value) -> Result<bool> + 'a,
    {
        Lazy::new(Filter { upstream: self, f })
    }

    pub fn take(self, n: usize) -> Lazy<'a> {
        Lazy::new(Take {
            upstream: self,
            remaining: n,
        })
    }

    pub fn drop(self, n: usize) -> Lazy<'a> {
        Lazy::new(Skip {
            upstream: self,
            pending: n,
        })
    }

    /// Expand every document into a sub-sequence, pulled one at a time.
    pub fn flat_map<F>(self, f: F) -> Lazy<'a>
    where
        F: FnMut(Value) -> Result<Lazy<'a>> + 'a,
    {
        Lazy::new(FlatMap {
            upstream: self,
            f,
            current: None,
        })
    }

    /// Materialize the whole upstream on first pull and hand it to `f`.
    pub fn transform<F>(self, f: F) -> Lazy<'a>
    where
        F: FnOnce(Vec<Value>) -> Result<Vec<Value>> + 'a,
    {
        self.transform_lazy(move |docs| f(docs).map(Lazy::from_vec))
    }

    /// Like `transform`, but `f` produces a sequence instead of a vector.
    pub fn transform_lazy<F>(self, f: F) -> Lazy<'a>
    where
        F: FnOnce(Vec<Value>) -> Result<Lazy<'a>> + 'a,
    {
        Lazy::new(Transform {
            state: TransformState::Pending {
                upstream: self,
                f: Box::new(f),
            },
        })
    }

    /// Exhaust each sequence in turn.
    pub fn concat(seqs: Vec<Lazy<'a>>) -> Lazy<'a> {
        Lazy::new(Concat {
            seqs: seqs.into_iter().collect(),
        })
    }

    /// Pull everything, stopping at the first error.
    pub fn value(self) -> Result<Vec<Value>> {
        self.collect()
    }
}

impl Iterator for Lazy<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

// ---------------------------------------------------------------------------
// Combinators
// ---------------------------------------------------------------------------

struct Map<'a, F> {
    upstream: Lazy<'a>,
    f: F,
}

impl<F> Iterator for Map<'_, F>
where
    F: FnMut(Value) -> Result<Value>,
{
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.upstream.next()?;
        Some(item.and_then(&mut self.f))
    }
}

struct Filter<'a, F> {
    upstream: Lazy<'a>,
    f: F,
}

impl<F> Iterator for Filter<'_, F>
where
    F: FnMut(&Value) -> Result<bool>,
{
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let doc = match self.upstream.next()? {
                Ok(doc) => doc,
                Err(e) => return Some(Err(e)),
            };
            match (self.f)(&doc) {
                Ok(true) => return Some(Ok(doc)),
                Ok(false) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

struct Take<'a> {
    upstream: Lazy<'a>,
    remaining: usize,
}

impl Iterator for Take<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.upstream.next()
    }
}

struct Skip<'a> {
    upstream: Lazy<'a>,
    pending: usize,
}

impl Iterator for Skip<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending > 0 {
            self.pending -= 1;
            if let Err(e) = self.upstream.next()? {
                return Some(Err(e));
            }
        }
        self.upstream.next()
    }
}

struct FlatMap<'a, F> {
    upstream: Lazy<'a>,
    f: F,
    current: Option<Lazy<'a>>,
}

impl<'a, F> Iterator for FlatMap<'a, F>
where
    F: FnMut(Value) -> Result<Lazy<'a>>,
{
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(item) = current.next() {
                    return Some(item);
                }
                self.current = None;
            }
            let doc = match self.upstream.next()? {
                Ok(doc) => doc,
                Err(e) => return Some(Err(e)),
            };
            match (self.f)(doc) {
                Ok(seq) => self.current = Some(seq),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

type TransformFn<'a> = Box<dyn FnOnce(Vec<Value>) -> Result<Lazy<'a>> + 'a>;

enum TransformState<'a> {
    Pending { upstream: Lazy<'a>, f: TransformFn<'a> },
    Ready(Lazy<'a>),
    Done,
}

struct Transform<'a> {
    state: TransformState<'a>,
}

impl Iterator for Transform<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, TransformState::Done) {
                TransformState::Pending { upstream, f } => {
                    let docs = match upstream.value() {
                        Ok(docs) => docs,
                        Err(e) => return Some(Err(e)),
                    };
                    match f(docs) {
                        Ok(seq) => self.state = TransformState::Ready(seq),
                        Err(e) => return Some(Err(e)),
                    }
                }
                TransformState::Ready(mut seq) => {
                    let item = seq.next();
                    if item.is_some() {
                        self.state = TransformState::Ready(seq);
                    }
                    return item;
                }
                TransformState::Done => return None,
            }
        }
    }
}

struct Concat<'a> {
    seqs: VecDeque<Lazy<'a>>,
}

impl Iterator for Concat<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(front) = self.seqs.front_mut() {
            if let Some(item) = front.next() {
                return Some(item);
            }
            self.seqs.pop_front();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    fn ints(n: i64) -> Vec<Value> {
        (1..=n).map(Value::Int).collect()
    }

    #[test]
    fn nothing_runs_until_pulled() {
        let calls = Cell::new(0);
        let mut seq = Lazy::from_vec(ints(3)).map(|v| {
            calls.set(calls.get() + 1);
            Ok(v)
        });
        assert_eq!(calls.get(), 0);
        assert!(seq.next().is_some());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn take_stops_pulling_upstream() {
        let pulled = Cell::new(0);
        let out = Lazy::from_vec(ints(10))
            .map(|v| {
                pulled.set(pulled.get() + 1);
                Ok(v)
            })
            .take(2)
            .value()
            .unwrap();
        assert_eq!(out, ints(2));
        assert_eq!(pulled.get(), 2);
    }

    #[test]
    fn filter_and_drop() {
        let out = Lazy::from_vec(ints(6))
            .filter(|v| Ok(v.as_i64().unwrap() % 2 == 0))
            .drop(1)
            .value()
            .unwrap();
        assert_eq!(out, vec![Value::Int(4), Value::Int(6)]);
    }

    #[test]
    fn drop_past_end() {
        let out = Lazy::from_vec(ints(2)).drop(5).value().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn transform_is_deferred() {
        let ran = Cell::new(false);
        let seq = Lazy::from_vec(ints(3)).transform(|mut docs| {
            ran.set(true);
            docs.reverse();
            Ok(docs)
        });
        assert!(!ran.get());
        assert_eq!(seq.value().unwrap(), vec![Value::Int(3), Value::Int(2), Value::Int(1)]);
        assert!(ran.get());
    }

    #[test]
    fn sort_then_limit_matches_full_sort() {
        let input: Vec<Value> = [5, 3, 9, 1, 7].into_iter().map(Value::Int).collect();
        let sorted = |mut docs: Vec<Value>| {
            docs.sort();
            Ok(docs)
        };
        let limited = Lazy::from_vec(input.clone()).transform(sorted).take(3).value().unwrap();
        let full = Lazy::from_vec(input).transform(sorted).value().unwrap();
        assert_eq!(limited, full[..3].to_vec());
    }

    #[test]
    fn concat_is_sequential() {
        let seq = Lazy::concat(vec![
            Lazy::from_vec(ints(2)),
            Lazy::empty(),
            Lazy::from_vec(vec![Value::Int(9)]),
        ]);
        assert_eq!(seq.value().unwrap(), vec![Value::Int(1), Value::Int(2), Value::Int(9)]);
    }

    #[test]
    fn flat_map_expands_lazily() {
        let out = Lazy::from_vec(ints(3))
            .flat_map(|v| {
                let n = v.as_i64().unwrap();
                Ok(Lazy::from_vec(vec![Value::Int(n); n as usize]))
            })
            .value()
            .unwrap();
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn errors_abort_materialization() {
        let result = Lazy::from_vec(ints(3))
            .map(|v| {
                if v == Value::Int(2) {
                    Err(Error::evaluation("$test", "boom"))
                } else {
                    Ok(v)
                }
            })
            .value();
        assert!(result.is_err());
    }

    #[test]
    fn exhaustion_is_permanent() {
        let mut remaining = 1;
        let mut seq = Lazy::from_fn(move || {
            if remaining > 0 {
                remaining -= 1;
                Some(Ok(Value::Null))
            } else {
                None
            }
        });
        assert!(seq.next().is_some());
        assert!(seq.next().is_none());
        assert!(seq.next().is_none());
    }
}
