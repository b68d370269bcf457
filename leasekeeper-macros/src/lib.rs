use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{parse_macro_input, Expr, ExprLit, ItemFn, Lit, Meta, Token};

/// Test attribute that installs tracing before the body runs.
///
/// Async tests are handed to `#[tokio::test]` with every argument except `timeout_ms`,
/// which bounds the whole body:
/// ```ignore
/// #[leasekeeper::test(flavor = "multi_thread", worker_threads = 2, timeout_ms = 5000)]
/// async fn migrates() { ... }
///
/// #[leasekeeper::test]
/// fn parses() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Meta, Token![,]>::parse_terminated);
    let input = parse_macro_input!(item as ItemFn);
    match expand(args, input) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(
    args: Punctuated<Meta, Token![,]>,
    input: ItemFn,
) -> syn::Result<proc_macro2::TokenStream> {
    let mut timeout_ms: Option<u64> = None;
    let mut tokio_args = Vec::new();
    for meta in args {
        match &meta {
            Meta::NameValue(nv) if nv.path.is_ident("timeout_ms") => {
                let Expr::Lit(ExprLit {
                    lit: Lit::Int(ms), ..
                }) = &nv.value
                else {
                    return Err(syn::Error::new(
                        nv.value.span(),
                        "timeout_ms takes an integer",
                    ));
                };
                timeout_ms = Some(ms.base10_parse()?);
            }
            _ => tokio_args.push(meta),
        }
    }

    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &sig.ident;

    if sig.asyncness.is_none() {
        if timeout_ms.is_some() || !tokio_args.is_empty() {
            return Err(syn::Error::new(
                sig.span(),
                "arguments are only accepted on async tests",
            ));
        }
        return Ok(quote! {
            #[test]
            #vis #sig {
                ::leasekeeper::trace::with_test_tracing_sync(stringify!(#name), || #block)
            }
        });
    }

    let tokio_attr = if tokio_args.is_empty() {
        quote! { #[tokio::test] }
    } else {
        quote! { #[tokio::test(#(#tokio_args),*)] }
    };
    let body = match timeout_ms {
        Some(ms) => quote! {
            ::tokio::time::timeout(::std::time::Duration::from_millis(#ms), async move #block)
                .await
                .expect(concat!(stringify!(#name), " timed out"))
        },
        None => quote! { #block },
    };
    Ok(quote! {
        #tokio_attr
        #vis #sig {
            ::leasekeeper::trace::with_test_tracing(stringify!(#name), || async move { #body }).await
        }
    })
}
