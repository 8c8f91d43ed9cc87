//! Attribute macros that run an async function on a fresh `chanloop::Loop`.
//!
//! The function may take a single argument, which is bound to the loop's
//! [`Handle`](../chanloop/struct.Handle.html):
//!
//! ```ignore
//! #[chanloop::test]
//! async fn sleeps(handle: chanloop::Handle) {
//!     handle.sleep(std::time::Duration::from_millis(5)).await;
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{FnArg, ItemFn, parse_macro_input};

/// Runs an async `main` on a new event loop.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    if input.sig.ident != "main" {
        return syn::Error::new_spanned(
            &input.sig.ident,
            "#[chanloop::main] can only be applied to the `main` function",
        )
        .to_compile_error()
        .into();
    }
    expand(input, false).into()
}

/// Runs an async test on a new event loop.
#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    expand(input, true).into()
}

fn expand(input: ItemFn, is_test: bool) -> TokenStream2 {
    if input.sig.asyncness.is_none() {
        return syn::Error::new_spanned(input.sig.fn_token, "the function must be async")
            .to_compile_error();
    }

    let bind = match input.sig.inputs.len() {
        0 => None,
        1 => match &input.sig.inputs[0] {
            FnArg::Typed(arg) => {
                let pat = &arg.pat;
                let ty = &arg.ty;
                Some(quote! { let #pat: #ty = event_loop.handle(); })
            }
            FnArg::Receiver(recv) => {
                return syn::Error::new_spanned(recv, "`self` is not allowed here")
                    .to_compile_error();
            }
        },
        _ => {
            return syn::Error::new_spanned(
                &input.sig.inputs,
                "expected no arguments or a single loop handle",
            )
            .to_compile_error();
        }
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    let name = &sig.ident;
    let output = &sig.output;
    let test_attr = is_test.then(|| quote! { #[::core::prelude::v1::test] });

    quote! {
        #test_attr
        #(#attrs)*
        #vis fn #name() #output {
            let mut event_loop = ::chanloop::Loop::new().expect("failed to start event loop");
            #bind
            event_loop
                .run(async move #block)
                .expect("event loop failed")
        }
    }
}
