//! Opaque native resource handles.

use std::num::NonZeroU64;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Wrap a raw handle returned by the engine. Zero is the null
            /// handle and yields `None`.
            pub fn from_raw(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map(Self)
            }

            /// The raw value, for passing back across the native boundary.
            pub fn as_raw(&self) -> u64 {
                self.0.get()
            }
        }
    };
}

native_handle!(
    /// Loaded model weights.
    ModelHandle
);

native_handle!(
    /// Inference context bound to one model.
    ContextHandle
);

native_handle!(
    /// Per-session decode batch.
    BatchHandle
);

native_handle!(
    /// Per-session sampler chain.
    SamplerHandle
);
