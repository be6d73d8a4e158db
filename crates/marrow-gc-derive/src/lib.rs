//! Derive macros for the `Trace` and `GarbageCollected` traits.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Attribute, Data, DeriveInput, Fields,
    GenericParam, Generics, Ident, Index, LitInt, Path,
};

/// Options accepted by `#[marrow_gc(...)]` on the deriving type.
struct ContainerOptions {
    krate: Path,
    space: Option<LitInt>,
}

impl ContainerOptions {
    fn from_attrs(attrs: &[Attribute]) -> Result<Self, syn::Error> {
        let mut options = Self {
            krate: parse_quote!(::marrow_gc),
            space: None,
        };

        for attr in attrs {
            if !attr.path().is_ident("marrow_gc") {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("crate") {
                    options.krate = meta.value()?.parse()?;
                    Ok(())
                } else if meta.path.is_ident("space") {
                    options.space = Some(meta.value()?.parse()?);
                    Ok(())
                } else {
                    Err(meta.error("unsupported attribute"))
                }
            })?;
        }

        Ok(options)
    }
}

/// Returns `true` for fields annotated `#[marrow_gc(ignore)]`.
fn is_ignored(attrs: &[Attribute]) -> Result<bool, syn::Error> {
    let mut ignored = false;
    for attr in attrs {
        if !attr.path().is_ident("marrow_gc") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("ignore") {
                ignored = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(ignored)
}

#[proc_macro_derive(Trace, attributes(marrow_gc))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let options = match ContainerOptions::from_attrs(&input.attrs) {
        Ok(options) => options,
        Err(err) => return err.into_compile_error().into(),
    };
    let krate = &options.krate;

    let name = &input.ident;
    let generics = add_trait_bounds(krate, input.generics.clone());
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace_body = match generate_trace_body(krate, name, &input.data) {
        Ok(body) => body,
        Err(err) => return err.into_compile_error().into(),
    };

    let generated = quote! {
        unsafe impl #impl_generics #krate::Trace for #name #ty_generics #where_clause {
            #[inline]
            #[allow(unused_variables)]
            fn trace(&self, visitor: &mut dyn #krate::Visitor) {
                #trace_body
            }
        }
    };

    generated.into()
}

#[proc_macro_derive(GarbageCollected, attributes(marrow_gc))]
pub fn derive_garbage_collected(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let options = match ContainerOptions::from_attrs(&input.attrs) {
        Ok(options) => options,
        Err(err) => return err.into_compile_error().into(),
    };
    let krate = &options.krate;

    let name = &input.ident;
    let generics = add_trait_bounds(krate, input.generics.clone());
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let space = options.space.as_ref().map(|index| {
        quote! {
            const SPACE: #krate::SpaceKind = #krate::SpaceKind::Custom(#index);
        }
    });

    let generated = quote! {
        impl #impl_generics #krate::GarbageCollected for #name #ty_generics #where_clause {
            #space
        }
    };

    generated.into()
}

fn add_trait_bounds(krate: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_trace = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Trace")
                } else {
                    false
                }
            });
            let has_static = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Lifetime(l) = b {
                    l.ident == "static"
                } else {
                    false
                }
            });

            if !has_trace {
                type_param.bounds.push(parse_quote!(#krate::Trace));
            }
            if !has_static {
                type_param.bounds.push(parse_quote!('static));
            }
        }
    }
    generics
}

fn generate_trace_body(krate: &Path, name: &Ident, data: &Data) -> Result<TokenStream, syn::Error> {
    match data {
        Data::Struct(data) => generate_struct_trace(krate, &data.fields),
        Data::Enum(data) => generate_enum_trace(krate, name, data),
        Data::Union(u) => Ok(quote_spanned! {
            u.union_token.span => compile_error!("`Trace` must be manually implemented for unions");
        }),
    }
}

fn generate_struct_trace(krate: &Path, fields: &Fields) -> Result<TokenStream, syn::Error> {
    let mut trace_calls = Vec::new();
    match fields {
        Fields::Named(f) => {
            for field in &f.named {
                if is_ignored(&field.attrs)? {
                    continue;
                }
                let name = &field.ident;
                trace_calls.push(quote_spanned! {field.span() =>
                    #krate::Trace::trace(&self.#name, visitor);
                });
            }
        }
        Fields::Unnamed(f) => {
            for (i, field) in f.unnamed.iter().enumerate() {
                if is_ignored(&field.attrs)? {
                    continue;
                }
                let index = Index::from(i);
                trace_calls.push(quote_spanned! {field.span() =>
                    #krate::Trace::trace(&self.#index, visitor);
                });
            }
        }
        Fields::Unit => {}
    }
    Ok(quote! { #(#trace_calls)* })
}

fn generate_enum_trace(
    krate: &Path,
    name: &Ident,
    data: &syn::DataEnum,
) -> Result<TokenStream, syn::Error> {
    let mut match_arms = Vec::new();
    for variant in &data.variants {
        let var_name = &variant.ident;
        let arm = match &variant.fields {
            Fields::Named(f) => {
                let mut bindings = Vec::new();
                let mut trace_calls = Vec::new();
                for (i, field) in f.named.iter().enumerate() {
                    let ident = field.ident.as_ref().expect("named field");
                    if is_ignored(&field.attrs)? {
                        bindings.push(quote! { #ident: _ });
                        continue;
                    }
                    let binding = format_ident!("field{}", i);
                    trace_calls.push(quote! { #krate::Trace::trace(#binding, visitor); });
                    bindings.push(quote! { #ident: #binding });
                }
                quote! {
                    #name::#var_name { #(#bindings),* } => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let mut bindings = Vec::new();
                let mut trace_calls = Vec::new();
                for (i, field) in f.unnamed.iter().enumerate() {
                    if is_ignored(&field.attrs)? {
                        bindings.push(quote! { _ });
                        continue;
                    }
                    let binding = format_ident!("field{}", i);
                    trace_calls.push(quote! { #krate::Trace::trace(#binding, visitor); });
                    bindings.push(quote! { #binding });
                }
                quote! {
                    #name::#var_name(#(#bindings),*) => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unit => quote! {
                #name::#var_name => {}
            },
        };
        match_arms.push(arm);
    }

    Ok(quote! {
        match self {
            #(#match_arms)*
        }
    })
}
