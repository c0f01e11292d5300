#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! Entry-point macros for the spindle runtime.

mod entry;

/// Marks an async function as the program entry point driven by a spindle
/// runtime. The macro builds the runtime, submits the function body as the
/// root task and blocks until it completes.
///
/// ```no_run
/// #[spindle::main]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[spindle::main]`:
///
/// ```no_run
/// fn main() {
///     spindle::runtime::Builder::new()
///         .build()
///         .expect("failed to build the runtime")
///         .run(async {
///             println!("Hello world");
///         })
/// }
/// ```
///
/// # Worker threads
///
/// The number of scheduler workers defaults to the number of CPUs and can
/// be pinned explicitly:
///
/// ```no_run
/// #[spindle::main(worker_threads = 2)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// # Function arguments
///
/// Function arguments are NOT allowed.
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Marks an async function as a test executed on a fresh spindle runtime.
///
/// ```no_run
/// #[spindle::test(worker_threads = 2)]
/// async fn my_test() {
///     assert!(true);
/// }
/// ```
///
/// Equivalent code not using `#[spindle::test]`:
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     spindle::runtime::Builder::new()
///         .worker_threads(2)
///         .build()
///         .expect("failed to build the runtime")
///         .run(async {
///             assert!(true);
///         })
/// }
/// ```
///
/// Each test gets its own runtime; worker threads default to the number of
/// CPUs, so tests that depend on parallelism should pin `worker_threads`.
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
