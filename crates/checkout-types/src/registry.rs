//! Registry trait for self-registering implementations.

/// Base trait for implementation registries.
///
/// Each pluggable module (storage backends, message buses) provides a
/// `Registry` struct implementing this trait, declaring the name used to
/// select it in configuration together with its factory function.
pub trait ImplementationRegistry {
	/// The name used in configuration files to reference this implementation,
	/// e.g. "memory" for `storage.implementations.memory`.
	const NAME: &'static str;

	/// The factory function type this implementation provides.
	type Factory;

	/// Get the factory function for this implementation.
	fn factory() -> Self::Factory;
}
