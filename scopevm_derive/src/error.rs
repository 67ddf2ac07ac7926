//! Derive macro for error types.
//!
//! Every enum variant (or the struct itself) carries an `#[error("...")]`
//! message. Tuple fields are referenced positionally (`{0}`), named fields by
//! name (`{ip}`). Every field must appear in the message.
//!
//! ```ignore
//! use scopevm_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum LoadError {
//!     #[error("missing sentinel")]
//!     MissingSentinel,
//!     #[error("bad opcode {opcode} at {index}")]
//!     BadOpcode { opcode: u16, index: usize },
//!     #[error("io: {0}")]
//!     Io(String),
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Enum(data) => {
            let arms = data
                .variants
                .iter()
                .map(|variant| {
                    let ident = &variant.ident;
                    let message = error_message(&variant.attrs, ident)?;
                    let (pattern, write) = render(&variant.fields, &message);
                    Ok(quote! { Self::#ident #pattern => #write, })
                })
                .collect::<syn::Result<Vec<_>>>()?;

            if arms.is_empty() {
                quote! { match *self {} }
            } else {
                quote! { match self { #(#arms)* } }
            }
        }
        Data::Struct(data) => {
            let message = error_message(&input.attrs, name)?;
            let (pattern, write) = render(&data.fields, &message);
            match &data.fields {
                Fields::Unit => write,
                _ => quote! {
                    let Self #pattern = self;
                    #write
                },
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                #body
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {}
    })
}

/// Builds the destructuring pattern for `fields` and the `write!` rendering `message`.
fn render(fields: &Fields, message: &LitStr) -> (TokenStream2, TokenStream2) {
    match fields {
        Fields::Unit => (TokenStream2::new(), quote! { write!(f, #message) }),
        Fields::Named(named) => {
            let idents: Vec<_> = named
                .named
                .iter()
                .filter_map(|field| field.ident.as_ref())
                .collect();
            (
                quote! { { #(#idents),* } },
                quote! { write!(f, #message, #(#idents = #idents),*) },
            )
        }
        Fields::Unnamed(unnamed) => {
            let idents: Vec<_> = (0..unnamed.unnamed.len())
                .map(|i| format_ident!("f{}", i))
                .collect();
            let message = LitStr::new(
                &positional_to_named(&message.value(), idents.len()),
                message.span(),
            );
            (
                quote! { ( #(#idents),* ) },
                quote! { write!(f, #message, #(#idents = #idents),*) },
            )
        }
    }
}

/// Finds the `#[error("...")]` message among `attrs`.
fn error_message<T: ToTokens>(attrs: &[Attribute], target: &T) -> syn::Result<LitStr> {
    let attr = attrs
        .iter()
        .find(|attr| attr.path().is_ident("error"))
        .ok_or_else(|| {
            syn::Error::new_spanned(
                target,
                "missing #[error(\"...\")] attribute; every error needs a display message",
            )
        })?;

    attr.parse_args::<LitStr>().map_err(|_| {
        syn::Error::new_spanned(
            &attr.meta,
            "expected a string literal, e.g. #[error(\"stack overflow at {ip}\")]",
        )
    })
}

/// Rewrites `{0}`, `{1}`, ... into `{f0}`, `{f1}`, ... so tuple fields bind by name.
fn positional_to_named(message: &str, count: usize) -> String {
    (0..count).rev().fold(message.to_string(), |acc, i| {
        acc.replace(&format!("{{{i}}}"), &format!("{{f{i}}}"))
            .replace(&format!("{{{i}:"), &format!("{{f{i}:"))
    })
}

#[cfg(test)]
mod tests {
    use super::positional_to_named;

    #[test]
    fn positional_arguments_become_named() {
        assert_eq!(positional_to_named("io: {0}", 1), "io: {f0}");
        assert_eq!(positional_to_named("{1} then {0}", 2), "{f1} then {f0}");
        assert_eq!(positional_to_named("code {0:#x}", 1), "code {f0:#x}");
    }

    #[test]
    fn higher_indices_are_not_clobbered() {
        let fields = 11;
        assert_eq!(positional_to_named("{10}/{1}", fields), "{f10}/{f1}");
    }
}
