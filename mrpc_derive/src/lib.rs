extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::{
    parse_macro_input, FnArg, GenericArgument, Ident, ItemTrait, LitStr, PathArguments, ReturnType,
    TraitItem, TraitItemFn, Type,
};

/// Turns a trait of rpc methods into a service.
///
/// ```rust,ignore
/// #[mrpc::service(name = "user-service")]
/// pub trait UserService {
///     async fn get_by_id(&self, ctx: Context, req: GetByIdReq) -> Result<User>;
///     async fn export(&self, ctx: Context, req: ExportReq) -> Reply<ExportResp>;
/// }
/// ```
///
/// Every method takes `&self`, a `Context` and one request value, and returns
/// `Result<Resp>` or `Reply<Resp>`. The wire method name is the method name in
/// UpperCamelCase (`get_by_id` is `GetById`). `name` defaults to the trait name.
///
/// Generated:
/// - a provided `into_service(self: Arc<Self>) -> Service` on the trait;
/// - `UserServiceClient`, implementing the trait over a `Stub`.
#[proc_macro_attribute]
pub fn service(attr: TokenStream, input: TokenStream) -> TokenStream {
    let mut name: Option<LitStr> = None;
    let attr_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            name = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("unsupported service attribute, expected `name = \"...\"`"))
        }
    });
    parse_macro_input!(attr with attr_parser);
    let input = parse_macro_input!(input as ItemTrait);

    match expand(name, input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

enum Shape {
    Result,
    Reply,
}

struct Method<'a> {
    ident: &'a Ident,
    wire_name: String,
    ctx_ident: &'a Ident,
    req_ident: &'a Ident,
    req_type: &'a Type,
    resp_type: &'a Type,
    shape: Shape,
    sig: &'a syn::Signature,
}

fn expand(name: Option<LitStr>, input: ItemTrait) -> syn::Result<proc_macro2::TokenStream> {
    let krate = crate_path();
    let trait_ident = &input.ident;
    let vis = &input.vis;
    let service_name = name
        .map(|lit| lit.value())
        .unwrap_or_else(|| trait_ident.to_string());
    let client_ident = format_ident!("{}Client", trait_ident);

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "service traits can not be generic",
        ));
    }

    let mut methods = Vec::new();
    for item in &input.items {
        match item {
            TraitItem::Fn(method) => methods.push(parse_method(method)?),
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "service traits may only contain rpc methods",
                ))
            }
        }
    }

    let registrations = methods.iter().map(|m| {
        let ident = m.ident;
        let wire_name = &m.wire_name;
        let req_type = m.req_type;
        let register = match m.shape {
            Shape::Result => quote!(register_fn),
            Shape::Reply => quote!(register_reply_fn),
        };
        quote! {
            {
                let this = self.clone();
                service.#register(#wire_name, move |ctx: #krate::Context, req: #req_type| {
                    let this = this.clone();
                    async move { this.#ident(ctx, req).await }
                });
            }
        }
    });

    let client_methods = methods.iter().map(|m| {
        let sig = m.sig;
        let wire_name = &m.wire_name;
        let resp_type = m.resp_type;
        let ctx = m.ctx_ident;
        let req = m.req_ident;
        let body = match m.shape {
            Shape::Result => quote! {
                self.stub.call::<_, #resp_type>(#ctx, #wire_name, &#req).await
            },
            Shape::Reply => quote! {
                #krate::Reply::from(self.stub.call::<_, #resp_type>(#ctx, #wire_name, &#req).await)
            },
        };
        quote! {
            #sig {
                #body
            }
        }
    });

    let items = &input.items;
    let attrs = &input.attrs;
    let supertraits = &input.supertraits;
    let colon = if supertraits.is_empty() {
        quote!()
    } else {
        quote!(:)
    };
    let doc_client = format!("Calls `{}` through a `Stub`.", service_name);

    Ok(quote! {
        #(#attrs)*
        #[#krate::async_trait]
        #vis trait #trait_ident #colon #supertraits {
            #(#items)*

            /// The method table of this implementation, for `Server::register`.
            fn into_service(self: ::std::sync::Arc<Self>) -> #krate::Service
            where
                Self: Sized + Send + Sync + 'static,
            {
                let mut service = #krate::Service::new(#service_name);
                #(#registrations)*
                service
            }
        }

        #[doc = #doc_client]
        #[derive(Clone)]
        #vis struct #client_ident {
            stub: #krate::Stub,
        }

        impl #client_ident {
            pub const SERVICE_NAME: &'static str = #service_name;

            pub fn new(invoker: ::std::sync::Arc<dyn #krate::Invoker>) -> Self {
                #client_ident {
                    stub: #krate::Stub::new(#service_name, invoker),
                }
            }

            pub fn with_mode(self, mode: #krate::CallMode) -> Self {
                #client_ident {
                    stub: self.stub.with_mode(mode),
                }
            }

            pub fn stub(&self) -> &#krate::Stub {
                &self.stub
            }
        }

        #[#krate::async_trait]
        impl #trait_ident for #client_ident {
            #(#client_methods)*
        }
    })
}

fn parse_method(method: &TraitItemFn) -> syn::Result<Method<'_>> {
    let sig = &method.sig;
    let shape_err = || {
        syn::Error::new(
            sig.span(),
            "rpc methods must look like `async fn m(&self, ctx: Context, req: Req) -> Result<Resp>` \
             or return `Reply<Resp>`",
        )
    };

    if sig.asyncness.is_none() || !sig.generics.params.is_empty() || method.default.is_some() {
        return Err(shape_err());
    }
    match sig.receiver() {
        Some(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => return Err(shape_err()),
    }
    if sig.inputs.len() != 3 {
        return Err(shape_err());
    }
    let (ctx_ident, req_ident) = match (arg_ident(&sig.inputs[1]), arg_ident(&sig.inputs[2])) {
        (Some(ctx), Some(req)) => (ctx, req),
        _ => {
            return Err(syn::Error::new(
                sig.inputs.span(),
                "rpc method arguments must be plain `name: Type` bindings",
            ))
        }
    };
    let ctx_type = match &sig.inputs[1] {
        FnArg::Typed(pat) => &*pat.ty,
        FnArg::Receiver(_) => return Err(shape_err()),
    };
    if last_segment(ctx_type).map(|(ident, _)| ident != "Context").unwrap_or(true) {
        return Err(syn::Error::new(ctx_type.span(), "the first argument must be a `Context`"));
    }
    let req_type = match &sig.inputs[2] {
        FnArg::Typed(pat) => &*pat.ty,
        FnArg::Receiver(_) => return Err(shape_err()),
    };
    if matches!(req_type, Type::Reference(_)) {
        return Err(syn::Error::new(
            req_type.span(),
            "the request is taken by value",
        ));
    }

    let output = match &sig.output {
        ReturnType::Type(_, ty) => &**ty,
        ReturnType::Default => return Err(shape_err()),
    };
    let (shape, resp_type) = match last_segment(output) {
        Some((ident, Some(inner))) if ident == "Result" => (Shape::Result, inner),
        Some((ident, Some(inner))) if ident == "Reply" => (Shape::Reply, inner),
        _ => {
            return Err(syn::Error::new(
                output.span(),
                "rpc methods return `Result<Resp>` or `Reply<Resp>`",
            ))
        }
    };

    Ok(Method {
        ident: &sig.ident,
        wire_name: upper_camel(&sig.ident.to_string()),
        ctx_ident,
        req_ident,
        req_type,
        resp_type,
        shape,
        sig,
    })
}

/// The last path segment of `ty` and its only generic type argument, if any.
fn last_segment(ty: &Type) -> Option<(&Ident, Option<&Type>)> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    let inner = match &segment.arguments {
        PathArguments::AngleBracketed(args) if args.args.len() == 1 => match &args.args[0] {
            GenericArgument::Type(inner) => Some(inner),
            _ => None,
        },
        _ => None,
    };
    Some((&segment.ident, inner))
}

/// The binding of a plain `name: Type` argument.
fn arg_ident(arg: &FnArg) -> Option<&Ident> {
    match arg {
        FnArg::Typed(pat) => match &*pat.pat {
            syn::Pat::Ident(ident) if ident.by_ref.is_none() && ident.subpat.is_none() => {
                Some(&ident.ident)
            }
            _ => None,
        },
        FnArg::Receiver(_) => None,
    }
}

fn upper_camel(snake: &str) -> String {
    snake
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

fn crate_path() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("mrpc") {
        Ok(proc_macro_crate::FoundCrate::Itself) => quote!(crate),
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        Err(_) => quote!(::mrpc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!("GetById", upper_camel("get_by_id"));
        assert_eq!("Export", upper_camel("export"));
        assert_eq!("ListV2", upper_camel("list_v2"));
    }

    #[test]
    fn rejects_bad_shapes() {
        let bad: Vec<TraitItemFn> = vec![
            syn::parse_quote!(fn sync(&self, ctx: Context, req: Req) -> Result<Resp>;),
            syn::parse_quote!(async fn no_ctx(&self, req: Req) -> Result<Resp>;),
            syn::parse_quote!(async fn by_ref(&self, ctx: Context, req: &Req) -> Result<Resp>;),
            syn::parse_quote!(async fn bare(&self, ctx: Context, req: Req) -> Resp;),
            syn::parse_quote!(async fn owned(self, ctx: Context, req: Req) -> Result<Resp>;),
            syn::parse_quote!(async fn wrong_ctx(&self, ctx: u32, req: Req) -> Result<Resp>;),
        ];
        for method in &bad {
            assert!(parse_method(method).is_err(), "{} accepted", method.sig.ident);
        }
    }

    #[test]
    fn accepts_result_and_reply() {
        let m: TraitItemFn =
            syn::parse_quote!(async fn get_by_id(&self, ctx: Context, req: GetByIdReq) -> Result<User>;);
        let parsed = parse_method(&m).unwrap();
        assert_eq!("GetById", parsed.wire_name);
        assert!(matches!(parsed.shape, Shape::Result));

        let m: TraitItemFn =
            syn::parse_quote!(async fn export(&self, ctx: mrpc::Context, req: Req) -> mrpc::Reply<Out>;);
        assert!(matches!(parse_method(&m).unwrap().shape, Shape::Reply));
    }

    #[test]
    fn expands_a_client() {
        let input: ItemTrait = syn::parse_quote! {
            pub trait UserService {
                async fn get_by_id(&self, ctx: Context, req: GetByIdReq) -> Result<User>;
            }
        };
        let out = expand(None, input).unwrap().to_string();
        assert!(out.contains("UserServiceClient"));
        assert!(out.contains("\"GetById\""));
        assert!(out.contains("into_service"));
    }
}
