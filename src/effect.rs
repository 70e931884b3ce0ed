//! Effect tags.
//!
//! An effect tag compares by pointer identity and carries a human name,
//! mirroring `lh_effect` in `types.h` (there, a pointer to a static
//! per-effect struct; `LH_DEFINE_EFFECT0` allocates one such struct per
//! effect at file scope). We allocate the backing struct once per callsite
//! behind a `OnceLock` rather than relying on a `static`, since a `static`
//! per user effect isn't something a library can generate on the caller's
//! behalf without a macro doing exactly that.

use std::sync::OnceLock;

#[derive(Debug)]
pub(crate) struct EffectTagInner {
    pub name: &'static str,
}

/// An opaque effect identity, compared by pointer equality. Two tags with
/// the same `name` are still distinct effects unless they are literally the
/// same allocation (same [`EffectTag`] value).
///
/// `EffectTag` itself is an ordinary `Send + Sync` pointer to leaked,
/// immutable data (an effect's identity isn't thread-bound, only the
/// continuations yielded under it are); the thread-confinement rule lives
/// on [`crate::fragment::Fragment`] and [`crate::resumption::Resumption`]
/// instead, which are only ever reached through a `NonNull` raw pointer and
/// so are already `!Send`/`!Sync` without needing a marker here.
#[derive(Clone, Copy)]
pub struct EffectTag(pub(crate) &'static EffectTagInner);

impl EffectTag {
    /// Leak a new, permanently-unique effect tag with the given name. Used
    /// by [`crate::define_effect!`]; exposed for callers that want to build
    /// effect identities dynamically instead of through the macro.
    pub fn new(name: &'static str) -> EffectTag {
        let inner = Box::leak(Box::new(EffectTagInner { name }));
        EffectTag(inner)
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }
}

impl PartialEq for EffectTag {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}
impl Eq for EffectTag {}

impl std::fmt::Debug for EffectTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EffectTag({})", self.0.name)
    }
}

/// Define a `static` effect tag, analogous to `LH_DEFINE_EFFECT0(name)`.
///
/// ```ignore
/// define_effect!(STATE, "State");
/// // ... STATE is a `fn() -> EffectTag` returning the same tag every call.
/// ```
#[macro_export]
macro_rules! define_effect {
    ($vis:vis $name:ident, $human:expr) => {
        $vis fn $name() -> $crate::effect::EffectTag {
            static TAG: ::std::sync::OnceLock<$crate::effect::EffectTag> = ::std::sync::OnceLock::new();
            *TAG.get_or_init(|| $crate::effect::EffectTag::new($human))
        }
    };
}

// Reserved internal tags: must never collide with a user
// effect. `__fragment` tags a fragment frame, `__scoped` tags a scoped
// frame, `__skip` tags a skip frame; `defer` is the reserved built-in
// cleanup effect.
define_effect!(pub(crate) fragment_tag, "__fragment");
define_effect!(pub(crate) scoped_tag, "__scoped");
define_effect!(pub(crate) skip_tag, "__skip");
define_effect!(pub defer_tag, "defer");
