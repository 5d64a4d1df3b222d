//! # tasks_timeout_derive
//! Helper crate for [tasks_timeout](../tasks_timeout/index.html)

extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{
    parse::{Parse, ParseStream},
    FnArg, Ident, ItemFn, LitBool, LitInt, Pat, ReturnType, Token, Type,
};

/// Fails the test when it runs longer than the given timeout, after dumping the
/// tracked tasks still running.
/// ````ignore
/// #[test]
/// #[timeout(100)]
/// fn test_in_milliseconds() {
///   // Do things
/// }
///
/// #[test]
/// #[timeout(secs = 2, cancel_on_timeout)]
/// fn test_in_seconds() {
///   // Do things
/// }
/// ````
/// Accepted arguments are a bare number of milliseconds or `ms = <n>`, or
/// `secs = <n>`, optionally followed by `cancel_on_timeout` (or
/// `cancel_on_timeout = <bool>`).
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, input: TokenStream) -> TokenStream {
    local_timeout(attr.into(), input.into()).into()
}

#[derive(Debug, PartialEq, Eq)]
struct Config {
    timeout_ms: u64,
    cancel_on_timeout: bool,
}

fn set_timeout(slot: &mut Option<u64>, lit: &LitInt, scale: u64) -> syn::Result<()> {
    if slot.is_some() {
        return Err(syn::Error::new(lit.span(), "timeout given more than once"));
    }
    let value: u64 = lit.base10_parse()?;
    match value.checked_mul(scale) {
        Some(timeout_ms) if timeout_ms > 0 => {
            *slot = Some(timeout_ms);
            Ok(())
        }
        _ => Err(syn::Error::new(
            lit.span(),
            "timeout must be a positive number of milliseconds",
        )),
    }
}

impl Parse for Config {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut timeout_ms = None;
        let mut cancel_on_timeout = false;

        while !input.is_empty() {
            if input.peek(LitInt) {
                set_timeout(&mut timeout_ms, &input.parse()?, 1)?;
            } else {
                let key: Ident = input.parse()?;
                match key.to_string().as_str() {
                    "ms" => {
                        input.parse::<Token![=]>()?;
                        set_timeout(&mut timeout_ms, &input.parse()?, 1)?;
                    }
                    "secs" => {
                        input.parse::<Token![=]>()?;
                        set_timeout(&mut timeout_ms, &input.parse()?, 1000)?;
                    }
                    "cancel_on_timeout" => {
                        cancel_on_timeout = if input.peek(Token![=]) {
                            input.parse::<Token![=]>()?;
                            input.parse::<LitBool>()?.value
                        } else {
                            true
                        };
                    }
                    other => {
                        return Err(syn::Error::new(
                            key.span(),
                            format!("unknown timeout argument `{}`", other),
                        ))
                    }
                }
            }
            if input.is_empty() {
                break;
            }
            input.parse::<Token![,]>()?;
        }

        match timeout_ms {
            Some(timeout_ms) => Ok(Config {
                timeout_ms,
                cancel_on_timeout,
            }),
            None => Err(syn::Error::new(
                Span::call_site(),
                "expected a timeout, e.g. `#[timeout(100)]` or `#[timeout(secs = 2)]`",
            )),
        }
    }
}

fn local_timeout(attr: TokenStream2, input: TokenStream2) -> TokenStream2 {
    let config = match syn::parse2::<Config>(attr) {
        Ok(config) => config,
        Err(err) => return err.to_compile_error(),
    };
    let ast = match syn::parse2::<ItemFn>(input) {
        Ok(ast) => ast,
        Err(err) => return err.to_compile_error(),
    };
    match timeout_setup(config, ast) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error(),
    }
}

/// Whether the declared return type is spelled as some `Result`, aliases included.
fn returns_result(output: &ReturnType) -> bool {
    match output {
        ReturnType::Type(_, ty) => match &**ty {
            Type::Path(path) => path
                .path
                .segments
                .last()
                .map_or(false, |segment| segment.ident == "Result"),
            _ => false,
        },
        ReturnType::Default => false,
    }
}

fn timeout_setup(config: Config, ast: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = ast;
    let name = sig.ident.to_string();
    let timeout_ms = config.timeout_ms;
    let cancel_on_timeout = config.cancel_on_timeout;
    let annotation = quote! {
        tasks_timeout::TimeoutAnnotation::new(#timeout_ms).cancel_on_timeout(#cancel_on_timeout)
    };

    let body = if sig.asyncness.is_some() {
        // A nested fn keeps the declared return type in charge of `?` conversions,
        // which an async block cannot express.
        let inner = format_ident!("__tasks_timeout_{}", sig.ident);
        let inputs = &sig.inputs;
        let output = &sig.output;
        let args = sig
            .inputs
            .iter()
            .map(|arg| match arg {
                FnArg::Typed(typed) => match &*typed.pat {
                    Pat::Ident(pat) => Ok(pat.ident.clone()),
                    other => Err(syn::Error::new_spanned(
                        other,
                        "timeout tests only support plain argument names",
                    )),
                },
                FnArg::Receiver(receiver) => Err(syn::Error::new_spanned(
                    receiver,
                    "timeout cannot be applied to methods",
                )),
            })
            .collect::<syn::Result<Vec<_>>>()?;
        quote! {
            async fn #inner(#inputs) #output #block
            tasks_timeout::local_async_timeout_core(
                #name,
                module_path!(),
                #annotation,
                #inner(#(#args),*),
            )
            .await
        }
    } else {
        let ret = match &sig.output {
            ReturnType::Default => quote! {},
            ReturnType::Type(_, ty) => quote! { -> #ty },
        };
        let core = if returns_result(&sig.output) {
            quote! { tasks_timeout::local_timeout_core_with_return }
        } else {
            quote! { tasks_timeout::local_timeout_core }
        };
        quote! {
            #core(#name, module_path!(), #annotation, move || #ret #block)
        }
    };

    Ok(quote! {
        #(#attrs)
        *
        #vis #sig {
            #body
        }
    })
}
