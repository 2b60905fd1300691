use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, LitStr, parse::Parse, parse::ParseStream, Token, Ident, ExprArray, Expr};

/// Parsed `#[relay_agent(...)]` attribute
struct AgentAttr {
    name: String,
    description: String,
    version: String,
    tier: Option<String>,
    capabilities: Vec<String>,
    channels: Vec<String>,
    tags: Vec<String>,
}

impl Parse for AgentAttr {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut name = String::new();
        let mut description = String::new();
        let mut version = String::from("0.1.0");
        let mut tier = None;
        let mut capabilities = Vec::new();
        let mut channels = Vec::new();
        let mut tags = Vec::new();

        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;

            if input.peek(LitStr) {
                let val: LitStr = input.parse()?;
                match key.to_string().as_str() {
                    "name" => name = val.value(),
                    "description" => description = val.value(),
                    "version" => version = val.value(),
                    "tier" => tier = Some(val.value()),
                    other => {
                        return Err(syn::Error::new_spanned(&key, format!("unknown relay_agent key `{other}`")));
                    }
                }
            } else if input.peek(syn::token::Bracket) {
                let content: ExprArray = input.parse()?;
                let vals: Vec<String> = content.elems.iter().filter_map(|e| {
                    if let Expr::Lit(syn::ExprLit { lit: syn::Lit::Str(s), .. }) = e {
                        Some(s.value())
                    } else {
                        None
                    }
                }).collect();

                match key.to_string().as_str() {
                    "capabilities" => capabilities = vals,
                    "channels" => channels = vals,
                    "tags" => tags = vals,
                    other => {
                        return Err(syn::Error::new_spanned(&key, format!("unknown relay_agent list `{other}`")));
                    }
                }
            } else {
                return Err(input.error("expected a string literal or a [..] list"));
            }

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(AgentAttr { name, description, version, tier, capabilities, channels, tags })
    }
}

/// Registers a compiled-in agent.
///
/// The annotated type must provide `async fn new_agent() -> anyhow::Result<Self>`
/// and implement `relay_shared::Agent` (usually returning `self.auto_metadata()`
/// from `metadata`).
#[proc_macro_attribute]
pub fn relay_agent(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    let attr = parse_macro_input!(attr as AgentAttr);

    match emit_agent_code(input, attr) {
        Ok(expanded) => TokenStream::from(expanded),
        Err(err) => err.to_compile_error().into(),
    }
}

fn tier_ident(tier: &str) -> Option<proc_macro2::Ident> {
    let ident = match tier.trim().to_ascii_lowercase().as_str() {
        "economy" => "Economy",
        "standard" => "Standard",
        "premium" => "Premium",
        _ => return None,
    };
    Some(quote::format_ident!("{}", ident))
}

fn channel_ident(channel: &str) -> Option<proc_macro2::Ident> {
    let ident = match channel.trim().to_ascii_lowercase().as_str() {
        "web" => "Web",
        "whatsapp" => "Whatsapp",
        "voice" => "Voice",
        _ => return None,
    };
    Some(quote::format_ident!("{}", ident))
}

fn emit_agent_code(input: DeriveInput, attr: AgentAttr) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    if attr.name.is_empty() {
        return Err(syn::Error::new_spanned(&input.ident, "Agent 'name' is required"));
    }
    if attr.description.is_empty() {
        return Err(syn::Error::new_spanned(&input.ident, "Agent 'description' is required"));
    }

    let tier = match attr.tier.as_deref() {
        None => quote::format_ident!("Standard"),
        Some(t) => tier_ident(t).ok_or_else(|| {
            syn::Error::new_spanned(&input.ident, format!("Unknown tier '{t}' (expected economy|standard|premium)"))
        })?,
    };

    let channel_names: Vec<String> = if attr.channels.is_empty() {
        vec!["web".into(), "whatsapp".into(), "voice".into()]
    } else {
        attr.channels.clone()
    };
    let mut channels = Vec::with_capacity(channel_names.len());
    for c in &channel_names {
        let ident = channel_ident(c).ok_or_else(|| {
            syn::Error::new_spanned(&input.ident, format!("Unknown channel '{c}' (expected web|whatsapp|voice)"))
        })?;
        channels.push(quote! { relay_shared::Channel::#ident });
    }

    let factory_name = quote::format_ident!("{}Factory", name);
    let agent_name_str = &attr.name;
    let description_str = &attr.description;
    let version_str = &attr.version;
    let caps_tokens = attr.capabilities.iter().map(|c| quote! { #c.to_string() });
    let tags_tokens = attr.tags.iter().map(|t| quote! { #t.to_string() });

    Ok(quote! {
        #input

        impl #name {
            pub const AGENT_NAME: &'static str = #agent_name_str;

            pub fn factory() -> std::sync::Arc<dyn relay_shared::AgentFactory> {
                std::sync::Arc::new(#factory_name)
            }

            fn auto_metadata(&self) -> relay_shared::AgentMetadata {
                let started = relay_shared::process_started_at();
                let capabilities: Vec<String> = vec![ #(#caps_tokens),* ];
                relay_shared::AgentMetadata {
                    name: Self::AGENT_NAME.to_string(),
                    version: #version_str.to_string(),
                    description: #description_str.to_string(),
                    capabilities: capabilities.into_iter().collect(),
                    model_tier: relay_shared::ModelTier::#tier,
                    channels: [ #(#channels),* ].into_iter().collect(),
                    tags: vec![ #(#tags_tokens),* ],
                    created_at: started,
                    updated_at: started,
                }
            }
        }

        pub struct #factory_name;

        #[async_trait::async_trait]
        impl relay_shared::AgentFactory for #factory_name {
            fn name(&self) -> &str { #agent_name_str }
            async fn create(&self) -> anyhow::Result<std::sync::Arc<dyn relay_shared::Agent>> {
                let agent = #name::new_agent().await?;
                Ok(std::sync::Arc::new(agent))
            }
        }

        relay_shared::inventory::submit! {
            relay_shared::AgentRegistrar {
                factory: #name::factory,
            }
        }
    })
}
