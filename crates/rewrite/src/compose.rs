use hindsight_core::{Document, TypeIdentity};

use crate::{ResourceRewriter, RewriteError};

/// Runs rewriters in order for both hooks and stops at the first error.
///
/// Member rules work on disjoint field paths, so serving does not need the
/// reverse order.
pub struct Sequence {
    rules: Vec<Box<dyn ResourceRewriter>>,
}

impl Sequence {
    pub fn new(rules: Vec<Box<dyn ResourceRewriter>>) -> Self {
        Self { rules }
    }
}

impl ResourceRewriter for Sequence {
    fn before_import(&self, doc: &mut Document) -> Result<(), RewriteError> {
        for r in &self.rules {
            r.before_import(doc)?;
        }
        Ok(())
    }

    fn before_serving(&self, doc: &mut Document) -> Result<(), RewriteError> {
        for r in &self.rules {
            r.before_serving(doc)?;
        }
        Ok(())
    }
}

/// Predicate over the declared type identity of a document.
pub type Condition = Box<dyn Fn(&TypeIdentity) -> bool + Send + Sync>;

/// Exact match on apiVersion and kind.
pub fn match_type(api_version: &str, kind: &str) -> Condition {
    let want = TypeIdentity::new(api_version, kind);
    Box::new(move |ti| *ti == want)
}

/// Applies the inner rewriter only when the condition holds.
pub struct When {
    condition: Condition,
    inner: Box<dyn ResourceRewriter>,
}

impl When {
    pub fn new<R: ResourceRewriter + 'static>(condition: Condition, inner: R) -> Self {
        Self { condition, inner: Box::new(inner) }
    }

    fn applies(&self, doc: &Document) -> bool {
        (self.condition)(&doc.type_identity())
    }
}

impl ResourceRewriter for When {
    fn before_import(&self, doc: &mut Document) -> Result<(), RewriteError> {
        if self.applies(doc) {
            return self.inner.before_import(doc);
        }
        Ok(())
    }

    fn before_serving(&self, doc: &mut Document) -> Result<(), RewriteError> {
        if self.applies(doc) {
            return self.inner.before_serving(doc);
        }
        Ok(())
    }
}
