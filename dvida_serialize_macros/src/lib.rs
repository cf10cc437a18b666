extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, parse_macro_input};

fn make_error(ident: &Ident, msg: &str) -> TokenStream {
    syn::Error::new_spanned(ident, msg)
        .to_compile_error()
        .into()
}

/// Derives `DvSerialize`/`DvDeserialize` for a plain-old-data struct by packing or
/// unpacking its named fields in declaration order.
#[proc_macro_derive(DvDeSer)]
pub fn derive_dv_de_ser(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let data_struct = match data {
        Data::Struct(data_struct) => data_struct,
        _ => return make_error(&ident, "DvDeSer can only be derived for structs"),
    };

    let fields = match data_struct.fields {
        Fields::Named(named) => named.named,
        _ => return make_error(&ident, "DvDeSer requires named fields"),
    };

    let field_names: Vec<&Ident> = fields
        .iter()
        .map(|f| f.ident.as_ref().expect("named field"))
        .collect();
    let field_types: Vec<&syn::Type> = fields.iter().map(|f| &f.ty).collect();

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let serialize_body = field_names.iter().map(|name| {
        quote! {
            written += dvida_serialize::DvSerialize::serialize(
                &self.#name,
                endianness,
                &mut target[written..],
            )?;
        }
    });

    let deserialize_body = field_names.iter().zip(field_types.iter()).map(|(name, ty)| {
        quote! {
            let (#name, consumed) = <#ty as dvida_serialize::DvDeserialize>::deserialize(
                endianness,
                &input[read..],
            )?;
            read += consumed;
        }
    });

    let struct_init = field_names.iter().map(|name| quote! { #name });

    let expanded = quote! {
        impl #impl_generics dvida_serialize::DvSerialize for #ident #ty_generics #where_clause {
            fn serialize(
                &self,
                endianness: dvida_serialize::Endianness,
                target: &mut [u8],
            ) -> Result<usize, dvida_serialize::DvSerErr> {
                let mut written = 0usize;
                #(#serialize_body)*
                Ok(written)
            }
        }

        impl #impl_generics dvida_serialize::DvDeserialize for #ident #ty_generics #where_clause {
            fn deserialize(
                endianness: dvida_serialize::Endianness,
                input: &[u8],
            ) -> Result<(Self, usize), dvida_serialize::DvDeErr> {
                let mut read = 0usize;
                #(#deserialize_body)*
                Ok((
                    Self {
                        #(#struct_init),*
                    },
                    read,
                ))
            }
        }
    };

    expanded.into()
}
