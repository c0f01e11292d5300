use proc_macro2::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::spanned::Spanned;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: syn::ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        parse_config(&input, args)
    };

    match config {
        Ok(config) => expand(input, false, config),
        Err(e) => {
            // Still expand to something close to the expected output so IDE
            // completions keep working on the item.
            token_stream_with_error(expand(input, false, Config::default()), e)
        }
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: syn::ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        parse_config(&input, args)
    };

    match config {
        Ok(config) => expand(input, true, config),
        Err(e) => token_stream_with_error(expand(input, true, Config::default()), e),
    }
}

#[derive(Default)]
struct Config {
    worker_threads: Option<usize>,
}

/// Spindle has a single runtime flavor, so the only knob is
/// `worker_threads = <number>`.
fn parse_config(input: &syn::ItemFn, args: TokenStream) -> Result<Config, syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }

    let args = AttributeArgs::parse_terminated.parse2(args)?;
    let mut config = Config::default();

    for arg in args {
        match &arg {
            syn::Meta::NameValue(namevalue) if namevalue.path.is_ident("worker_threads") => {
                if config.worker_threads.is_some() {
                    return Err(syn::Error::new_spanned(
                        namevalue,
                        "`worker_threads` set multiple times.",
                    ));
                }
                config.worker_threads = Some(parse_worker_threads(&namevalue.value)?);
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "unknown attribute; the only supported option is `worker_threads = <number>`",
                ));
            }
        }
    }

    Ok(config)
}

fn parse_worker_threads(value: &syn::Expr) -> Result<usize, syn::Error> {
    let syn::Expr::Lit(syn::ExprLit {
        lit: syn::Lit::Int(lit),
        ..
    }) = value
    else {
        return Err(syn::Error::new(
            value.span(),
            "`worker_threads` must be an integer literal",
        ));
    };

    let worker_threads = lit.base10_parse::<usize>()?;
    if worker_threads == 0 {
        return Err(syn::Error::new(lit.span(), "`worker_threads` may not be 0."));
    }

    Ok(worker_threads)
}

/// A bare `#[test]`-like attribute: any argument-free path whose last
/// segment is `test`, covering both `#[test]` and the
/// `#[::core::prelude::v1::test]` form other test macros emit.
fn is_test_attribute(attr: &syn::Attribute) -> bool {
    if !matches!(attr.meta, syn::Meta::Path(_)) {
        return false;
    }

    attr.path()
        .segments
        .last()
        .is_some_and(|segment| segment.arguments.is_none() && segment.ident == "test")
}

fn expand(mut input: syn::ItemFn, is_test: bool, config: Config) -> TokenStream {
    input.sig.asyncness = None;

    let mut builder = quote! { spindle::runtime::Builder::new() };
    if let Some(worker_threads) = config.worker_threads {
        builder = quote! { #builder.worker_threads(#worker_threads) };
    }

    let generated_attrs = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let syn::ItemFn {
        mut attrs,
        vis,
        sig,
        block,
    } = input;

    // `syn` collects the body's inner attributes into `attrs`; they are not
    // valid on the generated block, so lift them to outer position.
    for attr in &mut attrs {
        attr.style = syn::AttrStyle::Outer;
    }

    // The whole body becomes one async block: the root future is submitted
    // through the scheduler queues, so it must be an owned `Send + 'static`
    // value. The explicit `return` keeps the expansion valid when the body
    // ends in a value expression.
    quote! {
        #(#attrs)*
        #generated_attrs
        #vis #sig {
            let body = async #block;

            #[allow(clippy::expect_used, clippy::needless_return)]
            {
                return #builder
                    .build()
                    .expect("failed to build the runtime")
                    .run(body);
            }
        }
    }
}

fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
