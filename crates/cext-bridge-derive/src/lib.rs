//! Derive macro for the `Mark` trait.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Field, Fields,
    GenericParam, Generics, Ident, Index, Path,
};

/// Derives `cext_bridge::Mark` by marking every field in declaration order.
///
/// Fields tagged `#[cext_bridge(skip)]` are left out. Use
/// `#[cext_bridge(crate = path)]` on the type when the crate is renamed.
#[proc_macro_derive(Mark, attributes(cext_bridge))]
pub fn derive_mark(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut cext_bridge: Path = parse_quote!(::cext_bridge);

    for attr in &input.attrs {
        if !attr.path().is_ident("cext_bridge") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                cext_bridge = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&cext_bridge, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let mark_body = match generate_mark_body(&cext_bridge, name, &input.data) {
        Ok(body) => body,
        Err(err) => return err.into_compile_error().into(),
    };

    let generated = quote! {
        impl #impl_generics #cext_bridge::Mark for #name #ty_generics #where_clause {
            #[inline]
            #[allow(unused_variables)]
            fn mark(&self, marker: &#cext_bridge::Marker<'_>) {
                #mark_body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(cext_bridge: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_mark = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Mark")
                } else {
                    false
                }
            });

            if !has_mark {
                type_param.bounds.push(parse_quote!(#cext_bridge::Mark));
            }
        }
    }
    generics
}

fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for attr in &field.attrs {
        if !attr.path().is_ident("cext_bridge") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(skip)
}

fn generate_mark_body(cext_bridge: &Path, name: &Ident, data: &Data) -> syn::Result<TokenStream> {
    match data {
        Data::Struct(data) => generate_struct_mark(cext_bridge, &data.fields),
        Data::Enum(data) => generate_enum_mark(cext_bridge, name, data),
        Data::Union(u) => Ok(quote_spanned! {
            u.union_token.span => compile_error!("`Mark` must be manually implemented for unions");
        }),
    }
}

fn generate_struct_mark(cext_bridge: &Path, fields: &Fields) -> syn::Result<TokenStream> {
    let mut calls = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if is_skipped(field)? {
            continue;
        }
        let access = field.ident.as_ref().map_or_else(
            || {
                let index = Index::from(i);
                quote! { self.#index }
            },
            |ident| quote! { self.#ident },
        );
        calls.push(quote_spanned! {field.span() =>
            #cext_bridge::Mark::mark(&#access, marker);
        });
    }
    Ok(quote! { #(#calls)* })
}

fn generate_enum_mark(
    cext_bridge: &Path,
    name: &Ident,
    data: &syn::DataEnum,
) -> syn::Result<TokenStream> {
    let mut arms = Vec::new();
    for variant in &data.variants {
        let var_name = &variant.ident;
        let bindings: Vec<_> = (0..variant.fields.len())
            .map(|i| format_ident!("field{}", i))
            .collect();
        let mut calls = Vec::new();
        for (field, binding) in variant.fields.iter().zip(&bindings) {
            if !is_skipped(field)? {
                calls.push(quote! { #cext_bridge::Mark::mark(#binding, marker); });
            }
        }

        let pattern = match &variant.fields {
            Fields::Named(f) => {
                let idents = f.named.iter().filter_map(|f| f.ident.as_ref());
                quote! { #name::#var_name { #(#idents: #bindings),* } }
            }
            Fields::Unnamed(_) => quote! { #name::#var_name(#(#bindings),*) },
            Fields::Unit => quote! { #name::#var_name },
        };
        arms.push(quote! {
            #[allow(unused_variables)]
            #pattern => {
                #(#calls)*
            }
        });
    }

    Ok(quote! {
        match self {
            #(#arms)*
        }
    })
}
