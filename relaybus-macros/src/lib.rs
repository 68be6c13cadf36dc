//! Procedural macros for the relaybus integration-event bus.
//!
//! - `#[derive(IntegrationEvent)]`: Implements `relaybus::IntegrationEvent` for
//!   your type, preserving generics and bounds. `TYPE_NAME` is the type's
//!   identifier unless overridden with `#[integration_event(type_name = "...")]`.
//!
//! Usage:
//! ```rust,ignore
//! use relaybus::IntegrationEvent;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize, IntegrationEvent)]
//! struct OrderStartedEto { order_id: u64 }
//!
//! // Keeps the wire identity of a renamed type
//! #[derive(Clone, Serialize, Deserialize, IntegrationEvent)]
//! #[integration_event(type_name = "OrderPlacedEto")]
//! struct OrderCreatedEto { order_id: u64 }
//! ```
use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitStr, parse_macro_input};

#[proc_macro_derive(IntegrationEvent, attributes(integration_event))]
pub fn derive_integration_event(input: TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let type_name = match type_name_override(&input) {
        Ok(Some(name)) => name,
        Ok(None) => ident.to_string(),
        Err(e) => return e.to_compile_error().into(),
    };

    let expanded = quote! {
        impl #impl_generics relaybus::IntegrationEvent for #ident #ty_generics #where_clause {
            const TYPE_NAME: &'static str = #type_name;
        }
    };
    TokenStream::from(expanded)
}

fn type_name_override(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut type_name = None;
    for attr in input
        .attrs
        .iter()
        .filter(|a| a.path().is_ident("integration_event"))
    {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("type_name") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().trim().is_empty() {
                    return Err(meta.error("type_name must not be empty"));
                }
                type_name = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported integration_event attribute"))
            }
        })?;
    }
    Ok(type_name)
}
