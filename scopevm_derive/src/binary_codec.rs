//! Derive macro for binary serialization.
//!
//! Fields are written in declaration order through `crate::types::encoding`.
//! Enums are prefixed with a `u8` tag: the explicit discriminant when one is
//! given, otherwise one more than the previous variant's tag.
//!
//! ```ignore
//! use scopevm_derive::BinaryCodec;
//!
//! #[derive(BinaryCodec)]
//! pub struct Instruction {
//!     pub op: Opcode,
//!     pub a: u16,
//!     pub b: u16,
//!     pub c: u16,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DataEnum, DeriveInput, Expr, Fields, Lit, parse_macro_input};

pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn codec() -> TokenStream2 {
    quote! { crate::types::encoding }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let codec = codec();
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => {
            let (pattern, writes) = encode_fields(&data.fields);
            let build = decode_fields(quote! { Self }, &data.fields);
            let encode = match &data.fields {
                Fields::Unit => quote! { let _ = out; },
                _ => quote! {
                    let Self #pattern = self;
                    #(#writes)*
                },
            };
            let decode = match &data.fields {
                Fields::Unit => quote! {
                    let _ = input;
                    Ok(Self)
                },
                _ => quote! { Ok(#build) },
            };
            (encode, decode)
        }
        Data::Enum(data) => enum_bodies(data)?,
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec derive does not support unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics #codec::Encode for #name #ty_generics #where_clause {
            fn encode<S: #codec::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics #codec::Decode for #name #ty_generics #where_clause {
            fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, #codec::DecodeError> {
                #decode_body
            }
        }
    })
}

fn enum_bodies(data: &DataEnum) -> syn::Result<(TokenStream2, TokenStream2)> {
    let codec = codec();
    let tags = discriminants(data)?;

    let encode_arms = data.variants.iter().zip(&tags).map(|(variant, tag)| {
        let ident = &variant.ident;
        let (pattern, writes) = encode_fields(&variant.fields);
        quote! {
            Self::#ident #pattern => {
                #codec::Encode::encode(&#tag, out);
                #(#writes)*
            }
        }
    });

    let decode_arms = data.variants.iter().zip(&tags).map(|(variant, tag)| {
        let ident = &variant.ident;
        let build = decode_fields(quote! { Self::#ident }, &variant.fields);
        quote! { #tag => Ok(#build), }
    });

    Ok((
        quote! {
            match self {
                #(#encode_arms)*
            }
        },
        quote! {
            let tag: u8 = #codec::Decode::decode(input)?;
            match tag {
                #(#decode_arms)*
                _ => Err(#codec::DecodeError::InvalidValue),
            }
        },
    ))
}

/// Destructuring pattern plus one `encode` call per field.
fn encode_fields(fields: &Fields) -> (TokenStream2, Vec<TokenStream2>) {
    let codec = codec();
    match fields {
        Fields::Unit => (TokenStream2::new(), Vec::new()),
        Fields::Named(named) => {
            let idents: Vec<_> = named
                .named
                .iter()
                .filter_map(|field| field.ident.clone())
                .collect();
            let writes = idents
                .iter()
                .map(|ident| quote! { #codec::Encode::encode(#ident, out); })
                .collect();
            (quote! { { #(#idents),* } }, writes)
        }
        Fields::Unnamed(unnamed) => {
            let idents: Vec<_> = (0..unnamed.unnamed.len())
                .map(|i| format_ident!("f{}", i))
                .collect();
            let writes = idents
                .iter()
                .map(|ident| quote! { #codec::Encode::encode(#ident, out); })
                .collect();
            (quote! { ( #(#idents),* ) }, writes)
        }
    }
}

/// Constructor expression decoding every field in order.
fn decode_fields(path: TokenStream2, fields: &Fields) -> TokenStream2 {
    let codec = codec();
    match fields {
        Fields::Unit => path,
        Fields::Named(named) => {
            let reads = named.named.iter().map(|field| {
                let ident = &field.ident;
                quote! { #ident: #codec::Decode::decode(input)?, }
            });
            quote! { #path { #(#reads)* } }
        }
        Fields::Unnamed(unnamed) => {
            let reads = unnamed
                .unnamed
                .iter()
                .map(|_| quote! { #codec::Decode::decode(input)?, });
            quote! { #path ( #(#reads)* ) }
        }
    }
}

/// Resolves the `u8` tag of every variant.
fn discriminants(data: &DataEnum) -> syn::Result<Vec<u8>> {
    let mut tags = Vec::with_capacity(data.variants.len());
    let mut next: Option<u8> = Some(0);

    for variant in &data.variants {
        let tag = match &variant.discriminant {
            Some((_, expr)) => literal_tag(expr)?,
            None => next.ok_or_else(|| {
                syn::Error::new_spanned(&variant.ident, "enum tag overflows u8")
            })?,
        };
        tags.push(tag);
        next = tag.checked_add(1);
    }

    Ok(tags)
}

fn literal_tag(expr: &Expr) -> syn::Result<u8> {
    if let Expr::Lit(expr_lit) = expr
        && let Lit::Int(int) = &expr_lit.lit
    {
        return int.base10_parse::<u8>();
    }
    Err(syn::Error::new_spanned(
        expr,
        "BinaryCodec discriminants must be integer literals that fit in a u8",
    ))
}
